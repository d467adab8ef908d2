use crate::registry::ModelId;
use crate::validator::Rejection;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training request: {0}")]
    InvalidSpec(String),

    #[error("dataset rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("model {model_id} validation accuracy {accuracy:.3} is below threshold {threshold:.3}")]
    BelowAccuracyThreshold { model_id: ModelId, accuracy: f64, threshold: f64 },

    #[error("feature layout v{found} does not match model layout v{expected}")]
    IncompatibleFeatures { expected: u8, found: u8 },

    #[error("model {0} is already registered")]
    DuplicateModel(ModelId),

    #[error("{phase} phase exceeded its time budget")]
    Timeout { phase: &'static str },

    #[error("cancelled")]
    Cancelled,

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
