//! Configuration knobs of the escape analysis phase

use crate::error::{PeaError, PeaResult};
use serde::{Deserialize, Serialize};

/// Default bound on loop fixed-point rounds
pub const DEFAULT_MAX_LOOP_ITERATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeaConfig {
    /// Run the read elimination flavor of the analysis
    pub read_elimination: bool,

    /// Maximum number of analyze/apply/cleanup sweeps
    pub max_sweeps: usize,

    /// Maximum rounds per loop before the analysis gives up
    pub max_loop_iterations: usize,

    /// Allocations with more entries than this are never virtualized
    pub max_virtualization_length: usize,

    /// Run the incremental canonicalizer on touched nodes after each sweep
    pub canonicalize: bool,
}

impl Default for PeaConfig {
    fn default() -> Self {
        Self {
            read_elimination: true,
            max_sweeps: 2,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            max_virtualization_length: 32,
            canonicalize: true,
        }
    }
}

impl PeaConfig {
    /// Plain escape analysis without read elimination
    pub fn escape_analysis_only() -> Self {
        Self {
            read_elimination: false,
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> PeaResult<Self> {
        let config: PeaConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PeaResult<()> {
        if self.max_sweeps == 0 {
            return Err(PeaError::InvalidConfig("max_sweeps must be at least 1".into()));
        }
        if self.max_loop_iterations == 0 {
            return Err(PeaError::InvalidConfig(
                "max_loop_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
