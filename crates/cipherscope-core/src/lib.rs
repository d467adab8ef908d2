//! CipherScope core
//!
//! The job-oriented service around the training crate:
//! - `CipherScope`: submit classification and training jobs, manage models
//! - `jobs`: state machine, progress weighting and the job manager
//! - `storage`: SQLite persistence for jobs and feature vectors
//! - `config`: TOML configuration with environment overrides

pub mod config;
pub mod error;
pub mod jobs;
pub mod service;
pub mod storage;

pub use config::{Config, ConfigError};
pub use error::{CipherScopeError, Result};
pub use jobs::{
    FailureReason, FeaturePoint, Feedback, Job, JobEvent, JobId, JobKind, JobResult, JobState, JobStatus,
};
pub use service::CipherScope;

pub use cipherscope_training as training;
