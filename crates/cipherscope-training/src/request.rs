use crate::catalog;
use crate::error::{TrainingError, TrainingResult};
use crate::registry::ModelId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One labeled upload, not yet validated.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub label: String,
    pub format: String,
    pub bytes: Arc<[u8]>,
}

impl TrainingSample {
    pub fn new(label: impl Into<String>, format: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { label: label.into(), format: format.into(), bytes: bytes.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingRequest {
    pub samples: Vec<TrainingSample>,
    pub base_model: Option<ModelId>,
}

impl TrainingRequest {
    #[must_use]
    pub fn new(samples: Vec<TrainingSample>) -> Self {
        Self { samples, base_model: None }
    }

    #[must_use]
    pub fn with_base_model(mut self, id: ModelId) -> Self {
        self.base_model = Some(id);
        self
    }

    /// Canonical label set, sorted.
    #[must_use]
    pub fn label_set(&self) -> BTreeSet<String> {
        self.samples.iter().map(|s| catalog::canonical_label(&s.label)).collect()
    }

    /// Structural checks that need no payload parsing.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.samples.is_empty() {
            return Err(TrainingError::InvalidSpec("at least one labeled sample is required".to_string()));
        }
        for sample in &self.samples {
            if sample.label.trim().is_empty() {
                return Err(TrainingError::InvalidSpec("sample label must not be empty".to_string()));
            }
            if catalog::is_reserved(&sample.label) {
                return Err(TrainingError::InvalidSpec(format!(
                    "'{}' is reserved and cannot be used as a training label",
                    catalog::UNKNOWN_LABEL
                )));
            }
        }
        if self.label_set().len() < 2 {
            return Err(TrainingError::InvalidSpec("at least two distinct labels are required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub epochs: u32,
    pub learning_rate: f64,
    pub l2: f64,
    /// Fraction of each label's samples held out for validation.
    pub holdout_fraction: f64,
    pub min_accuracy: f64,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self { seed: 42, epochs: 200, learning_rate: 0.5, l2: 1e-3, holdout_fraction: 0.2, min_accuracy: 0.6 }
    }
}

impl TrainingHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidSpec("epochs must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidSpec("learning_rate must be > 0".to_string()));
        }
        if !self.l2.is_finite() || self.l2 < 0.0 {
            return Err(TrainingError::InvalidSpec("l2 must be >= 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.holdout_fraction) {
            return Err(TrainingError::InvalidSpec("holdout_fraction must be in [0, 1)".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_accuracy) {
            return Err(TrainingError::InvalidSpec("min_accuracy must be in [0, 1]".to_string()));
        }
        Ok(())
    }
}
