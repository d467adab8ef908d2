//! Configuration file support.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//! Discovery order: `$CIPHERSCOPE_CONFIG`, then `./cipherscope.toml`, then the
//! built-in defaults. `CIPHERSCOPE_DATA_DIR` and `CIPHERSCOPE_LOG_LEVEL`
//! override the file.

use crate::jobs::PhaseWeights;
use cipherscope_training::{ClassifierConfig, TrainerSettings, TrainingHyperParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "CIPHERSCOPE_CONFIG";
pub const DATA_DIR_ENV: &str = "CIPHERSCOPE_DATA_DIR";
pub const LOG_LEVEL_ENV: &str = "CIPHERSCOPE_LOG_LEVEL";
pub const LOCAL_CONFIG_FILE: &str = "cipherscope.toml";

const MIB: u64 = 1024 * 1024;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Upload size limits in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_classification_max_bytes")]
    pub classification_max_bytes: u64,

    #[serde(default = "default_training_max_bytes")]
    pub training_max_bytes: u64,
}

fn default_classification_max_bytes() -> u64 {
    10 * MIB
}

fn default_training_max_bytes() -> u64 {
    100 * MIB
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            classification_max_bytes: default_classification_max_bytes(),
            training_max_bytes: default_training_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Bytes processed between progress checkpoints.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_extraction_timeout_secs() -> u64 {
    300
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self { chunk_size: default_chunk_size(), timeout_secs: default_extraction_timeout_secs() }
    }
}

impl ExtractionConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(flatten)]
    pub hyperparams: TrainingHyperParams,

    /// Budget for fitting plus model validation.
    #[serde(default = "default_training_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_training_timeout_secs() -> u64 {
    600
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self { hyperparams: TrainingHyperParams::default(), timeout_secs: default_training_timeout_secs() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Seconds a finished job keeps its transient data.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_feature_trace_len")]
    pub feature_trace_len: usize,

    #[serde(default)]
    pub weights: PhaseWeights,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_feature_trace_len() -> usize {
    10
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            feature_trace_len: default_feature_trace_len(),
            weights: PhaseWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the model registry and the SQLite database. Unset keeps
    /// everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError(msg) => ConfigError::ParseError(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Locate and load configuration, then apply environment overrides.
    ///
    /// An explicit path must exist; the discovered local file is optional.
    pub fn discover(explicit: Option<&Path>) -> ConfigResult<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                let local = PathBuf::from(LOCAL_CONFIG_FILE);
                if local.exists() { Self::load_from_file(&local)? } else { Self::default() }
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                self.log_level = Some(level.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));

        if self.limits.classification_max_bytes == 0 || self.limits.training_max_bytes == 0 {
            return invalid("size limits must be > 0".to_string());
        }
        if self.extraction.chunk_size == 0 {
            return invalid("extraction.chunk_size must be > 0".to_string());
        }
        if self.jobs.max_concurrent == 0 {
            return invalid("jobs.max_concurrent must be > 0".to_string());
        }
        if !(0.0..=100.0).contains(&self.classifier.unknown_confidence_cap) {
            return invalid("classifier.unknown_confidence_cap must be in [0, 100]".to_string());
        }
        if self.classifier.tie_epsilon < 0.0 || self.classifier.ood_factor <= 0.0 {
            return invalid("classifier.tie_epsilon must be >= 0 and ood_factor > 0".to_string());
        }
        self.training.hyperparams.validate().map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        self.jobs.weights.validate().map_err(ConfigError::InvalidValue)?;
        Ok(())
    }

    /// Settings handed to the training orchestrator.
    #[must_use]
    pub fn trainer_settings(&self) -> TrainerSettings {
        TrainerSettings {
            hyperparams: self.training.hyperparams.clone(),
            classifier: self.classifier.clone(),
            size_limit: self.limits.training_max_bytes,
            chunk_size: self.extraction.chunk_size,
            extraction_timeout: self.extraction.timeout(),
            training_timeout: Duration::from_secs(self.training.timeout_secs),
        }
    }
}
