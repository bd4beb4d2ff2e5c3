//! Error type shared by the scheduler and the escape analysis phase

use crate::ir::BlockId;
use std::fmt;

/// Errors that abort escape analysis of a graph
#[derive(Debug)]
pub enum PeaError {
    /// A loop's symbolic state did not stabilize within the retry bound
    LoopDidNotConverge { header: BlockId, iterations: usize },

    /// The block structure cannot be handled by the driver
    InvalidSchedule(String),

    /// Configuration values out of range
    InvalidConfig(String),

    /// Configuration file could not be parsed
    Config(toml::de::Error),
}

impl fmt::Display for PeaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeaError::LoopDidNotConverge { header, iterations } => write!(
                f,
                "loop at {} did not converge after {} iterations",
                header, iterations
            ),
            PeaError::InvalidSchedule(msg) => write!(f, "Invalid schedule: {}", msg),
            PeaError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            PeaError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for PeaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeaError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for PeaError {
    fn from(e: toml::de::Error) -> Self {
        PeaError::Config(e)
    }
}

pub type PeaResult<T> = Result<T, PeaError>;
