//! The work futures behind classification and training jobs.

use crate::jobs::manager::{JobContext, JobFailure};
use crate::jobs::record::{FeaturePoint, JobResult};
use crate::jobs::state::{FailureReason, JobState};
use cipherscope_training::{
    classify, extract_incremental, ClassifierConfig, Dataset, FeatureStore, FeatureVector, ModelRegistry,
    ProgressEvent, ProgressSink, RunContext, TrainingError, TrainingOrchestrator, TrainingPhase, TrainingRequest,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct JobRunner {
    registry: Arc<ModelRegistry>,
    orchestrator: TrainingOrchestrator,
    features: Arc<dyn FeatureStore>,
    classifier: ClassifierConfig,
}

impl JobRunner {
    #[must_use]
    pub fn new(
        registry: Arc<ModelRegistry>,
        orchestrator: TrainingOrchestrator,
        features: Arc<dyn FeatureStore>,
        classifier: ClassifierConfig,
    ) -> Self {
        Self { registry, orchestrator, features, classifier }
    }

    fn extraction_timeout(&self) -> Duration {
        self.orchestrator.settings().extraction_timeout
    }

    /// Validating, Extracting, Classifying.
    pub async fn classify(
        self: Arc<Self>,
        ctx: JobContext,
        dataset: Dataset,
        known_algorithm: Option<String>,
    ) -> Result<JobResult, JobFailure> {
        ctx.enter(JobState::Validating)?;
        let model = self.registry.active().ok_or(FailureReason::NoActiveModel)?;
        model.verify_checksum().map_err(|e| job_failure(e, &JobState::Validating))?;
        ctx.progress(100.0);

        ctx.enter(JobState::Extracting)?;
        let vector = match self.features.get(dataset.id()) {
            Some(vector) => {
                debug!(job_id = %ctx.id(), dataset_id = %dataset.id(), "Feature cache hit");
                ctx.trace(FeaturePoint::from_sample(vector.sample(dataset.size()), None));
                ctx.progress(100.0);
                vector
            }
            None => {
                let vector = Arc::new(self.extract(&ctx, &dataset).await?);
                self.features.put(dataset.id(), Arc::clone(&vector));
                vector
            }
        };

        ctx.enter(JobState::Classifying)?;
        let result = classify(&vector, &model, &self.classifier, known_algorithm.as_deref())
            .map_err(|e| job_failure(e, &JobState::Classifying))?;
        ctx.progress(100.0);

        info!(
            job_id = %ctx.id(),
            model_id = %result.model_id,
            label = %result.label,
            confidence = result.confidence,
            out_of_distribution = result.out_of_distribution,
            "Classification finished"
        );
        Ok(JobResult::Classification(result))
    }

    async fn extract(&self, ctx: &JobContext, dataset: &Dataset) -> Result<FeatureVector, JobFailure> {
        let payload = dataset.payload();
        let timeout = self.extraction_timeout();
        let deadline = Instant::now().checked_add(timeout);
        let cancel = ctx.cancel_token();
        let chunk_size = self.orchestrator.settings().chunk_size;

        let work = extract_incremental(&payload, chunk_size, |progress| {
            if cancel.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TrainingError::Timeout { phase: JobState::Extracting.as_str() });
            }
            ctx.progress(progress.percent());
            ctx.trace(FeaturePoint::from_sample(progress.sample, None));
            Ok(())
        });

        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(e)) => Err(job_failure(e, &JobState::Extracting)),
            Err(_) => Err(timed_out(&JobState::Extracting)),
        }
    }

    /// Validating, Extracting, Training, ValidatingModel, driven by the
    /// orchestrator's phase events.
    pub async fn train(self: Arc<Self>, ctx: JobContext, request: TrainingRequest) -> Result<JobResult, JobFailure> {
        ctx.checkpoint()?;

        let sink = JobProgressSink { ctx: ctx.clone() };
        let run_ctx =
            RunContext { progress: &sink, cancel: ctx.cancel_token(), features: Some(self.features.as_ref()) };
        let settings = self.orchestrator.settings();
        let budget = settings.extraction_timeout.saturating_add(settings.training_timeout);

        match tokio::time::timeout(budget, self.orchestrator.run(request, run_ctx)).await {
            Ok(Ok(summary)) => Ok(JobResult::Training(summary)),
            Ok(Err(e)) => Err(job_failure(e, &ctx.snapshot().state)),
            Err(_) => Err(timed_out(&ctx.snapshot().state)),
        }
    }
}

/// Forwards orchestrator events onto the job record.
struct JobProgressSink {
    ctx: JobContext,
}

impl ProgressSink for JobProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::PhaseStarted { phase } => {
                let state = match phase {
                    TrainingPhase::DatasetValidation => JobState::Validating,
                    TrainingPhase::FeatureExtraction => JobState::Extracting,
                    TrainingPhase::Fitting => JobState::Training,
                    TrainingPhase::ModelValidation => JobState::ValidatingModel,
                };
                if let Err(e) = self.ctx.advance(state) {
                    warn!(job_id = %self.ctx.id(), %phase, error = %e, "Phase change not applied");
                }
            }
            ProgressEvent::Progress { percent, .. } => self.ctx.progress(percent),
            ProgressEvent::FeatureSample { label, sample } => {
                self.ctx.trace(FeaturePoint::from_sample(sample, Some(label)));
            }
            ProgressEvent::Message { message } => debug!(job_id = %self.ctx.id(), "{message}"),
        }
    }
}

fn timed_out(state: &JobState) -> JobFailure {
    JobFailure::Failed(FailureReason::Timeout { phase: state.as_str().to_string() })
}

/// Map a training-layer error onto a job outcome. Timeouts are attributed to
/// the job state that was running.
fn job_failure(err: TrainingError, state: &JobState) -> JobFailure {
    let reason = match err {
        TrainingError::Cancelled => return JobFailure::Cancelled,
        TrainingError::Timeout { .. } => return timed_out(state),
        TrainingError::Rejected(rejection) => FailureReason::ValidationError { detail: rejection.to_string() },
        TrainingError::InvalidSpec(detail) => FailureReason::ValidationError { detail },
        TrainingError::ModelNotFound(id) => FailureReason::NotFound { detail: format!("model {id}") },
        TrainingError::BelowAccuracyThreshold { model_id, accuracy, threshold } => {
            FailureReason::BelowAccuracyThreshold { model_id, accuracy, threshold }
        }
        other => FailureReason::internal(other),
    };
    JobFailure::Failed(reason)
}
