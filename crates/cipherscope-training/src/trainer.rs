//! Training orchestration.
//!
//! A run goes through four phases in order, each reporting 0..=100 through the
//! [`ProgressSink`]. Cancellation and deadlines are only observed at
//! checkpoints: per dataset, per extraction chunk and per epoch.

use crate::cache::FeatureStore;
use crate::classifier::{self, ClassifierConfig, ModelParams, SoftmaxFitter};
use crate::dataset::{combined_fingerprint, Dataset, DatasetId, LabeledDataset};
use crate::error::{TrainingError, TrainingResult};
use crate::features::{self, FeatureVector, FEATURE_COUNT, FEATURE_VERSION};
use crate::progress::{ProgressEvent, ProgressSink, TrainingPhase};
use crate::registry::{Model, ModelId, ModelRegistry, Provenance, ValidationMethod, ValidationReport};
use crate::request::{TrainingHyperParams, TrainingRequest};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerSettings {
    pub hyperparams: TrainingHyperParams,
    pub classifier: ClassifierConfig,
    /// Per-sample upload limit in bytes.
    pub size_limit: u64,
    pub chunk_size: usize,
    pub extraction_timeout: Duration,
    /// Budget shared by fitting and model validation.
    pub training_timeout: Duration,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            hyperparams: TrainingHyperParams::default(),
            classifier: ClassifierConfig::default(),
            size_limit: 100 * 1024 * 1024,
            chunk_size: 64 * 1024,
            extraction_timeout: Duration::from_secs(300),
            training_timeout: Duration::from_secs(600),
        }
    }
}

/// Per-run collaborators.
pub struct RunContext<'a> {
    pub progress: &'a dyn ProgressSink,
    pub cancel: CancellationToken,
    pub features: Option<&'a dyn FeatureStore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledFeatures {
    pub label: String,
    pub dataset_id: DatasetId,
    pub vector: FeatureVector,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub model_id: ModelId,
    pub version: u32,
    pub labels: Vec<String>,
    pub accuracy: f64,
    pub method: ValidationMethod,
    pub training_samples: usize,
    pub holdout_samples: usize,
    /// Transient; cleared once the owning job's retention window passes.
    #[serde(default)]
    pub feature_vectors: Vec<LabeledFeatures>,
}

struct Checkpoint<'a> {
    cancel: &'a CancellationToken,
    phase: TrainingPhase,
    deadline: Option<Instant>,
}

impl Checkpoint<'_> {
    fn check(&self) -> TrainingResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TrainingError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TrainingError::Timeout { phase: self.phase.as_str() });
        }
        Ok(())
    }
}

pub struct TrainingOrchestrator {
    registry: Arc<ModelRegistry>,
    settings: TrainerSettings,
}

impl TrainingOrchestrator {
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, settings: TrainerSettings) -> Self {
        Self { registry, settings }
    }

    #[must_use]
    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Run every phase and register the resulting model.
    ///
    /// A model below the accuracy threshold is still registered, and the run
    /// then fails with [`TrainingError::BelowAccuracyThreshold`].
    pub async fn run(&self, request: TrainingRequest, ctx: RunContext<'_>) -> TrainingResult<TrainingSummary> {
        request.validate()?;
        self.settings.hyperparams.validate()?;

        let datasets = self.validate_datasets(&request, &ctx)?;
        let base = match &request.base_model {
            Some(id) => Some(self.registry.get(id).ok_or_else(|| TrainingError::ModelNotFound(id.clone()))?),
            None => None,
        };

        let vectors = self.extract_all(&datasets, &ctx).await?;

        let labels: Vec<String> = request.label_set().into_iter().collect();
        let index: BTreeMap<&str, usize> = labels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();
        let targets: Vec<usize> = datasets.iter().map(|d| index[d.label.as_str()]).collect();
        let (train_rows, holdout_rows) = stratified_split(&targets, &self.settings.hyperparams);

        let training_deadline = deadline_after(self.settings.training_timeout);
        let params = self
            .fit(&vectors, &targets, &train_rows, &labels, base.as_deref(), &ctx, training_deadline)
            .await?;

        let report = self.evaluate(&params, &labels, &vectors, &targets, &train_rows, &holdout_rows, &ctx, training_deadline)?;

        let fingerprint = combined_fingerprint(datasets.iter().map(|d| d.dataset.id()));
        let provenance = Provenance {
            dataset_fingerprint: fingerprint,
            base_model: request.base_model.clone(),
            sample_count: datasets.len(),
        };
        let passed = report.passed();
        let accuracy = report.accuracy;
        let method = report.method;
        let model = Model::new(labels.clone(), params, provenance, report)?;
        let model_id = self.registry.register(model)?;
        let version = self.registry.get(&model_id).map_or(0, |m| m.version);

        if !passed {
            warn!(model_id = %model_id, accuracy, threshold = self.settings.hyperparams.min_accuracy, "Model below accuracy threshold");
            return Err(TrainingError::BelowAccuracyThreshold {
                model_id,
                accuracy,
                threshold: self.settings.hyperparams.min_accuracy,
            });
        }

        info!(model_id = %model_id, version, accuracy, ?method, "Training finished");
        Ok(TrainingSummary {
            model_id,
            version,
            labels,
            accuracy,
            method,
            training_samples: train_rows.len(),
            holdout_samples: holdout_rows.len(),
            feature_vectors: datasets
                .iter()
                .zip(&vectors)
                .map(|(d, v)| LabeledFeatures { label: d.label.clone(), dataset_id: d.dataset.id().clone(), vector: v.as_ref().clone() })
                .collect(),
        })
    }

    fn validate_datasets(&self, request: &TrainingRequest, ctx: &RunContext<'_>) -> TrainingResult<Vec<LabeledDataset>> {
        let phase = TrainingPhase::DatasetValidation;
        ctx.progress.on_event(ProgressEvent::PhaseStarted { phase });
        let checkpoint = Checkpoint { cancel: &ctx.cancel, phase, deadline: None };

        let total = request.samples.len();
        let mut out = Vec::with_capacity(total);
        for (i, sample) in request.samples.iter().enumerate() {
            checkpoint.check()?;
            let dataset = Dataset::validated(Arc::clone(&sample.bytes), &sample.format, self.settings.size_limit, Some(&sample.label))?;
            out.push(LabeledDataset::new(dataset, &sample.label));
            ctx.progress.on_event(ProgressEvent::Progress { phase, percent: percent_of(i + 1, total) });
        }
        Ok(out)
    }

    async fn extract_all(&self, datasets: &[LabeledDataset], ctx: &RunContext<'_>) -> TrainingResult<Vec<Arc<FeatureVector>>> {
        let phase = TrainingPhase::FeatureExtraction;
        ctx.progress.on_event(ProgressEvent::PhaseStarted { phase });
        let checkpoint = Checkpoint {
            cancel: &ctx.cancel,
            phase,
            deadline: deadline_after(self.settings.extraction_timeout),
        };

        let total = datasets.len();
        let mut out = Vec::with_capacity(total);
        for (i, labeled) in datasets.iter().enumerate() {
            checkpoint.check()?;
            let id = labeled.dataset.id();

            let cached = ctx.features.and_then(|store| store.get(id));
            let vector = if let Some(hit) = cached {
                debug!(dataset_id = %id, "Feature cache hit");
                hit
            } else {
                let payload = labeled.dataset.payload();
                let vector = features::extract_incremental(&payload, self.settings.chunk_size, |p| {
                    let percent = (i as f64 + p.percent() / 100.0) / total as f64 * 100.0;
                    ctx.progress.on_event(ProgressEvent::Progress { phase, percent });
                    checkpoint.check()
                })
                .await?;
                let vector = Arc::new(vector);
                if let Some(store) = ctx.features {
                    store.put(id, Arc::clone(&vector));
                }
                vector
            };

            let sample = vector.sample(labeled.dataset.size());
            ctx.progress.on_event(ProgressEvent::FeatureSample { label: labeled.label.clone(), sample });
            ctx.progress.on_event(ProgressEvent::Progress { phase, percent: percent_of(i + 1, total) });
            out.push(vector);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fit(
        &self,
        vectors: &[Arc<FeatureVector>],
        targets: &[usize],
        train_rows: &[usize],
        labels: &[String],
        base: Option<&Model>,
        ctx: &RunContext<'_>,
        deadline: Option<Instant>,
    ) -> TrainingResult<ModelParams> {
        let phase = TrainingPhase::Fitting;
        ctx.progress.on_event(ProgressEvent::PhaseStarted { phase });
        let checkpoint = Checkpoint { cancel: &ctx.cancel, phase, deadline };
        checkpoint.check()?;

        let rows: Vec<&[f64]> = train_rows.iter().map(|&r| vectors[r].as_slice()).collect();
        let (feature_mean, feature_scale) = classifier::fit_standardization(&rows, FEATURE_COUNT);
        let scaler = ModelParams {
            feature_mean,
            feature_scale,
            weights: Vec::new(),
            centroids: Vec::new(),
            ood_radius: 0.0,
        };

        let inputs: Vec<Vec<f64>> = rows.iter().map(|r| scaler.standardize(r)).collect();
        let row_targets: Vec<usize> = train_rows.iter().map(|&r| targets[r]).collect();

        let hp = &self.settings.hyperparams;
        let initial = base.and_then(|b| warm_start(b, labels));
        if let (Some(b), Some(_)) = (base, &initial) {
            debug!(base_model = %b.id, "Warm-starting from base model");
            ctx.progress.on_event(ProgressEvent::Message { message: format!("warm start from model {}", b.id) });
        }
        let mut fitter = SoftmaxFitter::new(inputs.clone(), row_targets.clone(), labels.len(), hp.learning_rate, hp.l2, initial);

        let epochs = hp.epochs as usize;
        for epoch in 0..epochs {
            checkpoint.check()?;
            let loss = fitter.step();
            if epoch % 50 == 0 {
                debug!(epoch, loss, "Fitting epoch");
            }
            ctx.progress.on_event(ProgressEvent::Progress { phase, percent: percent_of(epoch + 1, epochs) });
            tokio::task::yield_now().await;
        }

        let centroids = classifier::label_centroids(&inputs, &row_targets, labels.len());
        let ood_radius = classifier::manifold_radius(&inputs, &row_targets, &centroids);

        Ok(ModelParams { weights: fitter.into_weights(), centroids, ood_radius, ..scaler })
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        params: &ModelParams,
        labels: &[String],
        vectors: &[Arc<FeatureVector>],
        targets: &[usize],
        train_rows: &[usize],
        holdout_rows: &[usize],
        ctx: &RunContext<'_>,
        deadline: Option<Instant>,
    ) -> TrainingResult<ValidationReport> {
        let phase = TrainingPhase::ModelValidation;
        ctx.progress.on_event(ProgressEvent::PhaseStarted { phase });
        Checkpoint { cancel: &ctx.cancel, phase, deadline }.check()?;

        let (rows, method) = if holdout_rows.is_empty() {
            ctx.progress.on_event(ProgressEvent::Message {
                message: "hold-out set is empty, validating on the training set".to_string(),
            });
            (train_rows, ValidationMethod::Resubstitution)
        } else {
            (holdout_rows, ValidationMethod::HoldOut)
        };
        let eval: Vec<(&FeatureVector, usize)> = rows.iter().map(|&r| (vectors[r].as_ref(), targets[r])).collect();
        let accuracy = classifier::accuracy(params, labels, &eval, &self.settings.classifier);

        ctx.progress.on_event(ProgressEvent::Progress { phase, percent: 100.0 });
        Ok(ValidationReport {
            accuracy,
            method,
            evaluated: eval.len(),
            min_accuracy: self.settings.hyperparams.min_accuracy,
        })
    }
}

/// Split row indices per label with a seeded shuffle. Every label keeps at
/// least one training row.
fn stratified_split(targets: &[usize], hp: &TrainingHyperParams) -> (Vec<usize>, Vec<usize>) {
    let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &t) in targets.iter().enumerate() {
        by_label.entry(t).or_default().push(row);
    }

    let mut rng = StdRng::seed_from_u64(hp.seed);
    let mut train = Vec::new();
    let mut holdout = Vec::new();
    for rows in by_label.values_mut() {
        rows.shuffle(&mut rng);
        let hold = ((rows.len() as f64 * hp.holdout_fraction).floor() as usize).min(rows.len() - 1);
        holdout.extend_from_slice(&rows[..hold]);
        train.extend_from_slice(&rows[hold..]);
    }
    train.sort_unstable();
    holdout.sort_unstable();
    (train, holdout)
}

/// Base-model weights for labels shared with the new label set.
fn warm_start(base: &Model, labels: &[String]) -> Option<Vec<Vec<f64>>> {
    if base.feature_version != FEATURE_VERSION {
        return None;
    }
    let width = FEATURE_COUNT + 1;
    let rows = labels
        .iter()
        .map(|label| {
            base.labels
                .iter()
                .position(|l| l == label)
                .and_then(|i| base.params.weights.get(i))
                .filter(|w| w.len() == width)
                .cloned()
                .unwrap_or_else(|| vec![0.0; width])
        })
        .collect();
    Some(rows)
}

/// A budget too large to represent as an instant means no deadline.
fn deadline_after(budget: Duration) -> Option<Instant> {
    Instant::now().checked_add(budget)
}

fn percent_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFeatureCache;
    use crate::request::TrainingSample;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_event(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn noisy_hex(seed: u8, len: usize) -> Vec<u8> {
        let mut x = u32::from(seed) | 1;
        let mut out = String::new();
        while out.len() < len {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            out.push_str(&format!("{:02x},", x as u8));
        }
        out.pop();
        out.push('\n');
        out.into_bytes()
    }

    fn patterned(len: usize) -> Vec<u8> {
        let mut out = b"0011223344556677".repeat(len / 16);
        out.push(b'\n');
        out
    }

    fn orchestrator(settings: TrainerSettings) -> (Arc<ModelRegistry>, TrainingOrchestrator) {
        let registry = Arc::new(ModelRegistry::in_memory());
        (Arc::clone(&registry), TrainingOrchestrator::new(registry, settings))
    }

    fn ctx<'a>(sink: &'a RecordingSink, cancel: CancellationToken) -> RunContext<'a> {
        RunContext { progress: sink, cancel, features: None }
    }

    fn two_label_request() -> TrainingRequest {
        TrainingRequest::new(vec![
            TrainingSample::new("AES", "csv", noisy_hex(7, 2048)),
            TrainingSample::new("RSA", "txt", patterned(2048)),
        ])
    }

    #[tokio::test]
    async fn test_trains_and_registers_without_activating() {
        let (registry, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();

        let summary = trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap();

        assert_eq!(summary.labels, vec!["AES", "RSA"]);
        assert_eq!(summary.method, ValidationMethod::Resubstitution);
        assert!((summary.accuracy - 1.0).abs() < 1e-12);
        assert_eq!(summary.feature_vectors.len(), 2);
        assert!(registry.get(&summary.model_id).is_some());
        assert!(registry.active().is_none());

        let phases: Vec<TrainingPhase> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::PhaseStarted { phase } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                TrainingPhase::DatasetValidation,
                TrainingPhase::FeatureExtraction,
                TrainingPhase::Fitting,
                TrainingPhase::ModelValidation
            ]
        );
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_within_each_phase() {
        let (_, trainer) = orchestrator(TrainerSettings { chunk_size: 256, ..TrainerSettings::default() });
        let sink = RecordingSink::default();
        trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap();

        let mut last: BTreeMap<TrainingPhase, f64> = BTreeMap::new();
        for event in sink.events.lock().unwrap().iter() {
            if let ProgressEvent::Progress { phase, percent } = event {
                let prev = last.insert(*phase, *percent).unwrap_or(0.0);
                assert!(*percent >= prev, "{phase} went from {prev} to {percent}");
                assert!(*percent <= 100.0);
            }
        }
    }

    #[tokio::test]
    async fn test_identical_samples_fall_below_threshold() {
        let (registry, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let x = patterned(1024);
        let y = noisy_hex(3, 1024);
        let request = TrainingRequest::new(vec![
            TrainingSample::new("AES", "txt", x.clone()),
            TrainingSample::new("RSA", "txt", x),
            TrainingSample::new("AES", "csv", y.clone()),
            TrainingSample::new("RSA", "csv", y),
        ]);

        let err = trainer.run(request, ctx(&sink, CancellationToken::new())).await.unwrap_err();
        let TrainingError::BelowAccuracyThreshold { model_id, accuracy, .. } = err else {
            panic!("expected BelowAccuracyThreshold, got {err:?}");
        };
        assert!(accuracy <= 0.5);
        assert!(registry.get(&model_id).is_some());
        assert!(registry.activate(&model_id).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_first_checkpoint() {
        let (registry, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = trainer.run(two_label_request(), ctx(&sink, cancel)).await.unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_zero_extraction_budget_times_out() {
        let settings = TrainerSettings { extraction_timeout: Duration::ZERO, ..TrainerSettings::default() };
        let (_, trainer) = orchestrator(settings);
        let sink = RecordingSink::default();

        let err = trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, TrainingError::Timeout { phase: "feature_extraction" }));
    }

    #[tokio::test]
    async fn test_zero_training_budget_times_out_in_fitting() {
        let settings = TrainerSettings { training_timeout: Duration::ZERO, ..TrainerSettings::default() };
        let (registry, trainer) = orchestrator(settings);
        let sink = RecordingSink::default();

        let err = trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, TrainingError::Timeout { phase: "fitting" }));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_budgets_mean_no_deadline() {
        let settings = TrainerSettings {
            extraction_timeout: Duration::MAX,
            training_timeout: Duration::MAX,
            ..TrainerSettings::default()
        };
        let (_, trainer) = orchestrator(settings);
        let sink = RecordingSink::default();

        let summary = trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap();
        assert_eq!(summary.labels, vec!["AES", "RSA"]);
        assert!(deadline_after(Duration::MAX).is_none());
    }

    #[tokio::test]
    async fn test_malformed_sample_is_rejected() {
        let (_, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let request = TrainingRequest::new(vec![
            TrainingSample::new("AES", "json", b"{not json".to_vec()),
            TrainingSample::new("RSA", "txt", patterned(64)),
        ]);

        let err = trainer.run(request, ctx(&sink, CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, TrainingError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_base_model_is_not_found() {
        let (_, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let request = two_label_request().with_base_model(ModelId::from("missing"));

        let err = trainer.run(request, ctx(&sink, CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, TrainingError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_base_model_is_recorded_in_provenance() {
        let (registry, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let first = trainer.run(two_label_request(), ctx(&sink, CancellationToken::new())).await.unwrap();

        let second = trainer
            .run(two_label_request().with_base_model(first.model_id.clone()), ctx(&sink, CancellationToken::new()))
            .await
            .unwrap();

        let model = registry.get(&second.model_id).unwrap();
        assert_eq!(model.provenance.base_model, Some(first.model_id.clone()));
        assert_eq!(model.version, 2);

        let warm_start = format!("warm start from model {}", first.model_id);
        assert!(sink.events.lock().unwrap().iter().any(|e| matches!(e, ProgressEvent::Message { message } if *message == warm_start)));
    }

    #[tokio::test]
    async fn test_feature_store_is_populated_and_reused() {
        let (_, trainer) = orchestrator(TrainerSettings::default());
        let sink = RecordingSink::default();
        let cache = MemoryFeatureCache::new(8);

        let run = || RunContext { progress: &sink, cancel: CancellationToken::new(), features: Some(&cache) };
        let first = trainer.run(two_label_request(), run()).await.unwrap();
        assert_eq!(cache.len(), 2);
        let second = trainer.run(two_label_request(), run()).await.unwrap();
        assert_eq!(first.feature_vectors, second.feature_vectors);
    }

    #[test]
    fn test_split_keeps_one_training_row_per_label() {
        let hp = TrainingHyperParams { holdout_fraction: 0.5, ..TrainingHyperParams::default() };
        let targets = vec![0, 0, 0, 0, 1];
        let (train, holdout) = stratified_split(&targets, &hp);
        assert_eq!(holdout.len(), 2);
        assert_eq!(train.len(), 3);
        assert!(train.contains(&4));
        assert_eq!(stratified_split(&targets, &hp), (train, holdout));
    }
}
