//! Job lifecycle states and phase weighting.

use cipherscope_training::ModelId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const CLASSIFY_SEQUENCE: &[JobState] =
    &[JobState::Queued, JobState::Validating, JobState::Extracting, JobState::Classifying];

const TRAIN_SEQUENCE: &[JobState] = &[
    JobState::Queued,
    JobState::Validating,
    JobState::Extracting,
    JobState::Training,
    JobState::ValidatingModel,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Classify,
    Train,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Train => "train",
        }
    }

    /// Non-terminal states in the order a job of this kind visits them.
    #[must_use]
    pub fn sequence(self) -> &'static [JobState] {
        match self {
            Self::Classify => CLASSIFY_SEQUENCE,
            Self::Train => TRAIN_SEQUENCE,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure recorded on a job, with a stable code.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("validation failed: {detail}")]
    ValidationError { detail: String },

    #[error("no active model")]
    NoActiveModel,

    #[error("not found: {detail}")]
    NotFound { detail: String },

    #[error("model {model_id} accuracy {accuracy:.3} is below threshold {threshold:.3}")]
    BelowAccuracyThreshold { model_id: ModelId, accuracy: f64, threshold: f64 },

    #[error("{phase} timed out")]
    Timeout { phase: String },

    #[error("internal error: {detail}")]
    InternalError { detail: String },

    #[error("interrupted by a restart")]
    Interrupted,
}

impl FailureReason {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "validation_error",
            Self::NoActiveModel => "no_active_model",
            Self::NotFound { .. } => "not_found",
            Self::BelowAccuracyThreshold { .. } => "below_accuracy_threshold",
            Self::Timeout { .. } => "timeout",
            Self::InternalError { .. } => "internal_error",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::InternalError { detail: detail.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Validating,
    Extracting,
    Classifying,
    Training,
    /// Held-out evaluation of a freshly fitted model.
    ValidatingModel,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Validating => "validating",
            Self::Extracting => "extracting",
            Self::Classifying => "classifying",
            Self::Training => "training",
            Self::ValidatingModel => "validating_model",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Transitions only move forward through the kind's sequence, one step at
    /// a time. `Failed` and `Cancelled` are reachable from any non-terminal
    /// state; `Completed` only from the last phase.
    #[must_use]
    pub fn can_transition_to(&self, kind: JobKind, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }

        let sequence = kind.sequence();
        let Some(current) = sequence.iter().position(|s| s == self) else {
            return false;
        };

        match next {
            Self::Failed(_) | Self::Cancelled => true,
            Self::Completed => current + 1 == sequence.len(),
            _ => sequence.iter().position(|s| s == next) == Some(current + 1),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({})", reason.code()),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyWeights {
    pub validating: u32,
    pub extracting: u32,
    pub classifying: u32,
}

impl Default for ClassifyWeights {
    fn default() -> Self {
        Self { validating: 10, extracting: 70, classifying: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainWeights {
    pub validating: u32,
    pub extracting: u32,
    pub training: u32,
    pub validating_model: u32,
}

impl Default for TrainWeights {
    fn default() -> Self {
        Self { validating: 5, extracting: 25, training: 50, validating_model: 20 }
    }
}

/// Fixed share (percent) of overall progress per phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub classify: ClassifyWeights,
    pub train: TrainWeights,
}

impl PhaseWeights {
    fn weights(&self, kind: JobKind) -> Vec<(JobState, u32)> {
        match kind {
            JobKind::Classify => vec![
                (JobState::Validating, self.classify.validating),
                (JobState::Extracting, self.classify.extracting),
                (JobState::Classifying, self.classify.classifying),
            ],
            JobKind::Train => vec![
                (JobState::Validating, self.train.validating),
                (JobState::Extracting, self.train.extracting),
                (JobState::Training, self.train.training),
                (JobState::ValidatingModel, self.train.validating_model),
            ],
        }
    }

    /// Weighted overall progress for a job in `state` at `phase_progress`.
    #[must_use]
    pub fn overall(&self, kind: JobKind, state: &JobState, phase_progress: f64) -> f64 {
        match state {
            JobState::Queued => return 0.0,
            JobState::Completed => return 100.0,
            _ => {}
        }

        let mut offset = 0.0;
        for (phase, weight) in self.weights(kind) {
            let weight = f64::from(weight);
            if &phase == state {
                return (offset + weight * phase_progress.clamp(0.0, 100.0) / 100.0).min(100.0);
            }
            offset += weight;
        }
        offset.min(100.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        for kind in [JobKind::Classify, JobKind::Train] {
            let total: u32 = self.weights(kind).iter().map(|(_, w)| w).sum();
            if total != 100 {
                return Err(format!("{kind} phase weights sum to {total}, expected 100"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sequence_is_forward_only() {
        let kind = JobKind::Classify;
        assert!(JobState::Queued.can_transition_to(kind, &JobState::Validating));
        assert!(JobState::Validating.can_transition_to(kind, &JobState::Extracting));
        assert!(JobState::Classifying.can_transition_to(kind, &JobState::Completed));

        assert!(!JobState::Extracting.can_transition_to(kind, &JobState::Validating));
        assert!(!JobState::Validating.can_transition_to(kind, &JobState::Classifying));
        assert!(!JobState::Extracting.can_transition_to(kind, &JobState::Completed));
        assert!(!JobState::Extracting.can_transition_to(kind, &JobState::Training));
    }

    #[test]
    fn test_train_sequence_includes_model_validation() {
        let kind = JobKind::Train;
        assert!(JobState::Extracting.can_transition_to(kind, &JobState::Training));
        assert!(JobState::Training.can_transition_to(kind, &JobState::ValidatingModel));
        assert!(JobState::ValidatingModel.can_transition_to(kind, &JobState::Completed));
        assert!(!JobState::Training.can_transition_to(kind, &JobState::Completed));
        assert!(!JobState::Extracting.can_transition_to(kind, &JobState::Classifying));
    }

    #[test]
    fn test_failure_and_cancel_from_any_active_state() {
        for state in JobKind::Train.sequence() {
            assert!(state.can_transition_to(JobKind::Train, &JobState::Cancelled));
            assert!(state.can_transition_to(JobKind::Train, &JobState::Failed(FailureReason::NoActiveModel)));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for state in [JobState::Completed, JobState::Cancelled, JobState::Failed(FailureReason::Interrupted)] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(JobKind::Classify, &JobState::Cancelled));
        }
    }

    #[test]
    fn test_overall_progress_uses_weights() {
        let weights = PhaseWeights::default();
        assert_eq!(weights.overall(JobKind::Classify, &JobState::Queued, 50.0), 0.0);
        assert!((weights.overall(JobKind::Classify, &JobState::Validating, 100.0) - 10.0).abs() < 1e-9);
        assert!((weights.overall(JobKind::Classify, &JobState::Extracting, 50.0) - 45.0).abs() < 1e-9);
        assert!((weights.overall(JobKind::Train, &JobState::Training, 50.0) - 55.0).abs() < 1e-9);
        assert_eq!(weights.overall(JobKind::Train, &JobState::Completed, 0.0), 100.0);
    }

    #[test]
    fn test_weights_must_sum_to_100() {
        assert!(PhaseWeights::default().validate().is_ok());
        let mut weights = PhaseWeights::default();
        weights.train.training = 10;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_state_serializes_with_reason_code() {
        let state = JobState::Failed(FailureReason::Timeout { phase: "fitting".to_string() });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"]["code"], "timeout");
        let back: JobState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
