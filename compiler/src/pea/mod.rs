//! Partial escape analysis and read elimination
//!
//! Allocations that do not escape on a control flow path are replaced by
//! their field values on that path and only materialized where they do
//! escape. The analysis never mutates the graph while it runs: every change
//! is recorded as an [`Effect`] and replayed after the traversal.
//!
//! Module map:
//!
//! - [`effects`]: the effect log and its replay
//! - [`state`]: per-path symbolic state (virtual objects, read cache)
//! - [`iteration`]: reverse postorder driver with loop fixed points
//! - [`escape`]: the transfer function for escape analysis
//! - [`virtualize`]: per-node rules for nodes that touch virtual objects
//! - [`merge`]: joining states at control flow merges
//! - [`read_elimination`]: load/store forwarding on the same state
//! - [`phase`]: the sweep controller

pub mod config;
pub mod effects;
pub mod escape;
pub mod iteration;
mod merge;
pub mod phase;
mod read_elimination;
pub mod state;
pub mod stats;
pub mod virtualize;

pub use config::PeaConfig;
pub use effects::{Effect, EffectList, InsertPoint};
pub use escape::PartialEscapeClosure;
pub use iteration::{BlockIterator, EffectsClosure, SweepEffects};
pub use phase::PartialEscapePhase;
pub use state::{BlockState, ObjectState, VirtualId};
pub use stats::{MaterializeReason, PeaStatistics};
pub use virtualize::VirtualizerTool;
