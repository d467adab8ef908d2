//! Error types for CipherScope core.

use crate::config::ConfigError;
use crate::jobs::JobId;
use crate::storage::StorageError;
use cipherscope_training::{ModelId, Rejection, TrainingError};
use thiserror::Error;

/// Synchronous errors returned by the service API.
///
/// Failures that happen inside a running job are recorded on the job as a
/// `FailureReason` instead.
#[derive(Error, Debug)]
pub enum CipherScopeError {
    #[error("validation error: {0}")]
    Validation(#[from] Rejection),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("model {model_id} accuracy {accuracy:.3} is below threshold {threshold:.3}")]
    BelowAccuracyThreshold { model_id: ModelId, accuracy: f64, threshold: f64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Training error: {0}")]
    Training(TrainingError),
}

impl CipherScopeError {
    /// Stable reason code, shared with job failure reasons.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidRequest(_) => "validation_error",
            Self::JobNotFound(_) | Self::ModelNotFound(_) => "not_found",
            Self::BelowAccuracyThreshold { .. } => "below_accuracy_threshold",
            Self::InvalidState(_) => "invalid_state",
            Self::Config(_) | Self::Storage(_) | Self::Training(_) => "internal_error",
        }
    }
}

impl From<TrainingError> for CipherScopeError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::Rejected(rejection) => Self::Validation(rejection),
            TrainingError::InvalidSpec(msg) => Self::InvalidRequest(msg),
            TrainingError::ModelNotFound(id) => Self::ModelNotFound(id),
            TrainingError::BelowAccuracyThreshold { model_id, accuracy, threshold } => {
                Self::BelowAccuracyThreshold { model_id, accuracy, threshold }
            }
            other => Self::Training(other),
        }
    }
}

/// Result type alias for CipherScope operations.
pub type Result<T> = std::result::Result<T, CipherScopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_errors_map_to_codes() {
        let err: CipherScopeError = TrainingError::ModelNotFound(ModelId::from("m")).into();
        assert_eq!(err.code(), "not_found");

        let err: CipherScopeError = TrainingError::Rejected(Rejection::FileTooLarge { size: 2, limit: 1 }).into();
        assert!(matches!(err, CipherScopeError::Validation(Rejection::FileTooLarge { .. })));
        assert_eq!(err.code(), "validation_error");

        let err: CipherScopeError = TrainingError::Artifact("boom".to_string()).into();
        assert_eq!(err.code(), "internal_error");
    }
}
