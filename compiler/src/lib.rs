pub mod error;
pub mod ir;
pub mod logging;
pub mod pea;

pub use error::{PeaError, PeaResult};
pub use pea::{PartialEscapePhase, PeaConfig, PeaStatistics};
