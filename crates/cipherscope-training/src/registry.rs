//! Model registry.
//!
//! Registration is append-only and models are never mutated once stored. The
//! active pointer is swapped under the write lock after it has been persisted,
//! so readers observe either the previous or the new active model.

use crate::artifacts::{checksum_model, ArtifactChecksum};
use crate::classifier::ModelParams;
use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::features::FEATURE_VERSION;
use crate::layout::{write_json_atomic, RegistryLayout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    HoldOut,
    /// Hold-out set was empty; accuracy measured on the training samples.
    Resubstitution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub accuracy: f64,
    pub method: ValidationMethod,
    pub evaluated: usize,
    pub min_accuracy: f64,
}

impl ValidationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.accuracy >= self.min_accuracy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Combined fingerprint of every training dataset.
    pub dataset_fingerprint: DatasetId,
    pub base_model: Option<ModelId>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    /// Assigned by the registry on registration, starting at 1.
    pub version: u32,
    pub labels: Vec<String>,
    pub feature_version: u8,
    pub params: ModelParams,
    pub created_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub validation: ValidationReport,
    pub checksum: ArtifactChecksum,
}

impl Model {
    pub fn new(
        labels: Vec<String>,
        params: ModelParams,
        provenance: Provenance,
        validation: ValidationReport,
    ) -> TrainingResult<Self> {
        let checksum = checksum_model(&labels, &params)?;
        Ok(Self {
            id: ModelId::new(),
            version: 0,
            labels,
            feature_version: FEATURE_VERSION,
            params,
            created_at: Utc::now(),
            provenance,
            validation,
            checksum,
        })
    }

    /// Only models that cleared their accuracy threshold may be activated.
    #[must_use]
    pub fn is_activatable(&self) -> bool {
        self.validation.passed()
    }

    pub fn verify_checksum(&self) -> TrainingResult<()> {
        let actual = checksum_model(&self.labels, &self.params)?;
        if actual != self.checksum {
            return Err(TrainingError::Artifact(format!("checksum mismatch for model {}", self.id)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivePointer {
    model_id: Option<ModelId>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    models: HashMap<ModelId, Arc<Model>>,
    order: Vec<ModelId>,
    active: Option<ModelId>,
}

#[derive(Debug)]
pub struct ModelRegistry {
    layout: Option<RegistryLayout>,
    state: RwLock<RegistryState>,
}

impl ModelRegistry {
    /// Registry without durable storage.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { layout: None, state: RwLock::new(RegistryState::default()) }
    }

    /// Open (or create) a registry persisted under `layout`.
    ///
    /// Model files that fail to parse or verify are skipped with a warning; an
    /// active pointer naming a missing model is dropped.
    pub fn open(layout: RegistryLayout) -> TrainingResult<Self> {
        layout.ensure_dirs()?;

        let mut loaded: Vec<Model> = Vec::new();
        for path in layout.model_files()? {
            let parsed = std::fs::read(&path)
                .map_err(TrainingError::from)
                .and_then(|bytes| serde_json::from_slice::<Model>(&bytes).map_err(TrainingError::from))
                .and_then(|model| model.verify_checksum().map(|()| model));
            match parsed {
                Ok(model) => loaded.push(model),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable model file"),
            }
        }
        loaded.sort_by_key(|m| m.version);

        let mut state = RegistryState::default();
        for model in loaded {
            state.order.push(model.id.clone());
            state.models.insert(model.id.clone(), Arc::new(model));
        }

        let pointer_path = layout.active_pointer_path();
        if pointer_path.exists() {
            let pointer: ActivePointer = serde_json::from_slice(&std::fs::read(&pointer_path)?)?;
            match pointer.model_id {
                Some(id) if state.models.contains_key(&id) => state.active = Some(id),
                Some(id) => warn!(model_id = %id, "Active pointer references a missing model"),
                None => {}
            }
        }

        info!(models = state.order.len(), active = ?state.active, "Model registry opened");
        Ok(Self { layout: Some(layout), state: RwLock::new(state) })
    }

    /// Store a new model and return its id. The model is not activated.
    pub fn register(&self, mut model: Model) -> TrainingResult<ModelId> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.models.contains_key(&model.id) {
            return Err(TrainingError::DuplicateModel(model.id));
        }

        let last = state.order.last().and_then(|id| state.models.get(id)).map_or(0, |m| m.version);
        model.version = last + 1;

        if let Some(layout) = &self.layout {
            write_json_atomic(&layout.model_path(&model.id), &model)?;
        }

        let id = model.id.clone();
        info!(model_id = %id, version = model.version, labels = ?model.labels, "Model registered");
        state.order.push(id.clone());
        state.models.insert(id.clone(), Arc::new(model));
        Ok(id)
    }

    /// Make `id` the active model. Unknown ids and models below their accuracy
    /// threshold leave the current active pointer untouched.
    pub fn activate(&self, id: &ModelId) -> TrainingResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let model = state.models.get(id).ok_or_else(|| TrainingError::ModelNotFound(id.clone()))?;
        if !model.is_activatable() {
            return Err(TrainingError::BelowAccuracyThreshold {
                model_id: id.clone(),
                accuracy: model.validation.accuracy,
                threshold: model.validation.min_accuracy,
            });
        }

        self.persist_pointer(Some(id))?;
        state.active = Some(id.clone());
        info!(model_id = %id, "Model activated");
        Ok(())
    }

    pub fn deactivate(&self) -> TrainingResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.persist_pointer(None)?;
        if let Some(previous) = state.active.take() {
            info!(model_id = %previous, "Model deactivated");
        }
        Ok(())
    }

    fn persist_pointer(&self, id: Option<&ModelId>) -> TrainingResult<()> {
        if let Some(layout) = &self.layout {
            let pointer = ActivePointer { model_id: id.cloned(), updated_at: Utc::now() };
            write_json_atomic(&layout.active_pointer_path(), &pointer)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn active(&self) -> Option<Arc<Model>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.active.as_ref().and_then(|id| state.models.get(id)).cloned()
    }

    #[must_use]
    pub fn active_id(&self) -> Option<ModelId> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).active.clone()
    }

    #[must_use]
    pub fn get(&self, id: &ModelId) -> Option<Arc<Model>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).models.get(id).cloned()
    }

    /// All models in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Model>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.order.iter().filter_map(|id| state.models.get(id)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn model(accuracy: f64) -> Model {
        let params = ModelParams {
            feature_mean: vec![0.0],
            feature_scale: vec![1.0],
            weights: vec![vec![0.0, 0.1], vec![0.0, -0.1]],
            centroids: vec![vec![0.0], vec![1.0]],
            ood_radius: 1.0,
        };
        Model::new(
            vec!["AES".to_string(), "RSA".to_string()],
            params,
            Provenance { dataset_fingerprint: DatasetId("fp".to_string()), base_model: None, sample_count: 2 },
            ValidationReport { accuracy, method: ValidationMethod::HoldOut, evaluated: 2, min_accuracy: 0.6 },
        )
        .unwrap()
    }

    #[test]
    fn test_register_assigns_versions_and_does_not_activate() {
        let registry = ModelRegistry::in_memory();
        let a = registry.register(model(1.0)).unwrap();
        let b = registry.register(model(1.0)).unwrap();

        assert_eq!(registry.get(&a).unwrap().version, 1);
        assert_eq!(registry.get(&b).unwrap().version, 2);
        assert!(registry.active().is_none());
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = ModelRegistry::in_memory();
        let m = model(1.0);
        registry.register(m.clone()).unwrap();
        assert!(matches!(registry.register(m), Err(TrainingError::DuplicateModel(_))));
    }

    #[test]
    fn test_activate_unknown_model_keeps_active() {
        let registry = ModelRegistry::in_memory();
        let id = registry.register(model(1.0)).unwrap();
        registry.activate(&id).unwrap();

        let err = registry.activate(&ModelId::from("missing")).unwrap_err();
        assert!(matches!(err, TrainingError::ModelNotFound(_)));
        assert_eq!(registry.active_id(), Some(id));
    }

    #[test]
    fn test_below_threshold_model_cannot_be_activated() {
        let registry = ModelRegistry::in_memory();
        let id = registry.register(model(0.5)).unwrap();
        assert!(matches!(registry.activate(&id), Err(TrainingError::BelowAccuracyThreshold { .. })));
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_deactivate_clears_pointer() {
        let registry = ModelRegistry::in_memory();
        let id = registry.register(model(1.0)).unwrap();
        registry.activate(&id).unwrap();
        registry.deactivate().unwrap();
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_persisted_registry_reopens_with_active_pointer() {
        let temp = TempDir::new().unwrap();
        let layout = RegistryLayout::for_data_dir(temp.path());

        let (first, second) = {
            let registry = ModelRegistry::open(layout.clone()).unwrap();
            let first = registry.register(model(1.0)).unwrap();
            let second = registry.register(model(0.9)).unwrap();
            registry.activate(&second).unwrap();
            (first, second)
        };

        let reopened = ModelRegistry::open(layout).unwrap();
        let ids: Vec<ModelId> = reopened.list().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![first, second.clone()]);
        assert_eq!(reopened.active_id(), Some(second));
    }

    #[test]
    fn test_tampered_model_is_skipped_on_open() {
        let temp = TempDir::new().unwrap();
        let layout = RegistryLayout::for_data_dir(temp.path());
        let registry = ModelRegistry::open(layout.clone()).unwrap();
        let id = registry.register(model(1.0)).unwrap();

        let path = layout.model_path(&id);
        let mut stored: Model = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        stored.params.ood_radius = 99.0;
        std::fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();

        assert!(ModelRegistry::open(layout).unwrap().list().is_empty());
    }
}
