use crate::features::FeatureSample;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    DatasetValidation,
    FeatureExtraction,
    Fitting,
    ModelValidation,
}

impl TrainingPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DatasetValidation => "dataset_validation",
            Self::FeatureExtraction => "feature_extraction",
            Self::Fitting => "fitting",
            Self::ModelValidation => "model_validation",
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted { phase: TrainingPhase },
    /// Percent within the phase, 0..=100.
    Progress { phase: TrainingPhase, percent: f64 },
    FeatureSample { label: String, sample: FeatureSample },
    /// Free-form note about the run, such as a warm start.
    Message { message: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}
