//! Run configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields the
//! reference settings. The CLI loads a file first and then applies flag
//! overrides on top of it.

use crate::fence::DEFAULT_IQR_MULTIPLIER;
use crate::hmc::{NutsConfig, SamplingError};
use crate::imputation::ImputationOptions;
use crate::normalize::AgeOffsetPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid [sampler] settings: {0}")]
    Sampler(#[from] SamplingError),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FenceConfig {
    pub iqr_multiplier: f64,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            iqr_multiplier: DEFAULT_IQR_MULTIPLIER,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub age_offset: AgeOffsetPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fence: FenceConfig,
    pub normalization: NormalizationConfig,
    pub sampler: NutsConfig,
    pub imputation: ImputationOptions,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let multiplier = self.fence.iqr_multiplier;
        if !(multiplier >= 0.0 && multiplier.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "fence.iqr_multiplier",
                reason: format!("must be finite and non-negative, got {multiplier}"),
            });
        }
        let mass = self.imputation.interval_mass;
        if !(mass > 0.0 && mass < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "imputation.interval_mass",
                reason: format!("must lie in (0, 1), got {mass}"),
            });
        }
        if self.imputation.histogram_bins == 0 {
            return Err(ConfigError::InvalidValue {
                field: "imputation.histogram_bins",
                reason: "at least one bin is required".to_string(),
            });
        }
        self.sampler.validate()?;
        Ok(())
    }
}
