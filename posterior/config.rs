use crate::simulate::{CovariancePolicy, SimulationError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read simulation config: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse simulation config: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid simulation config: {0}")]
    Invalid(#[from] SimulationError),
}

/// Options recognized by the simulator and summarizer. Every field has a
/// default, so a TOML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub draws: usize,
    pub by_term: bool,
    pub lower_tail: f64,
    pub upper_tail: f64,
    /// Keep the raw ensemble alongside the summary.
    pub keep_ensemble: bool,
    pub seed: u64,
    pub covariance_policy: CovariancePolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            draws: 1000,
            by_term: false,
            lower_tail: 0.025,
            upper_tail: 0.975,
            keep_ensemble: false,
            seed: 1034,
            covariance_policy: CovariancePolicy::PseudoInverse,
        }
    }
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: SimulationConfig = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.draws == 0 {
            return Err(SimulationError::InvalidDrawCount);
        }
        validate_tails(self.lower_tail, self.upper_tail)
    }
}

/// `0 <= lower < upper <= 1`; NaN fails every comparison and is rejected.
pub fn validate_tails(lower: f64, upper: f64) -> Result<(), SimulationError> {
    if (0.0..=1.0).contains(&lower) && (0.0..=1.0).contains(&upper) && lower < upper {
        Ok(())
    } else {
        Err(SimulationError::InvalidTailProbabilities { lower, upper })
    }
}
