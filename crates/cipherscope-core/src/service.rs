//! The `CipherScope` service: the single entry point presentation layers
//! (CLI, HTTP) talk to.

use crate::config::Config;
use crate::error::{CipherScopeError, Result};
use crate::jobs::{
    FeaturePoint, Feedback, Job, JobEvent, JobId, JobKind, JobManager, JobRunner, JobSettings, JobStatus,
};
use crate::storage::{Database, SharedDatabase, SqliteFeatureStore, StorageError};
use cipherscope_training::{
    Dataset, FeatureStore, LayeredFeatureStore, MemoryFeatureCache, Model, ModelId, ModelRegistry, RegistryLayout,
    TrainingOrchestrator, TrainingRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DATABASE_FILE: &str = "cipherscope.db";

const FEATURE_CACHE_CAPACITY: usize = 256;

pub struct CipherScope {
    config: Config,
    registry: Arc<ModelRegistry>,
    jobs: Arc<JobManager>,
    runner: Arc<JobRunner>,
}

impl CipherScope {
    /// Open the service described by `config`.
    ///
    /// With `storage.data_dir` set, models live under `<data_dir>/models` and
    /// jobs and feature vectors in `<data_dir>/cipherscope.db`; jobs left
    /// unfinished by a previous process are marked interrupted.
    pub fn open(config: Config) -> Result<Self> {
        let Some(data_dir) = config.storage.data_dir.clone() else {
            return Self::in_memory(config);
        };
        config.validate()?;

        std::fs::create_dir_all(&data_dir).map_err(StorageError::from)?;
        let db = Database::open(&data_dir.join(DATABASE_FILE))?.into_shared();
        let registry = Arc::new(ModelRegistry::open(RegistryLayout::for_data_dir(&data_dir))?);
        let features: Arc<dyn FeatureStore> = Arc::new(LayeredFeatureStore::new(
            MemoryFeatureCache::new(FEATURE_CACHE_CAPACITY),
            Arc::new(SqliteFeatureStore::new(Arc::clone(&db))),
        ));

        let service = Self::assemble(config, registry, features, Some(db));
        let interrupted = service.jobs.recover_interrupted()?;
        info!(
            data_dir = %data_dir.display(),
            models = service.registry.list().len(),
            interrupted,
            "CipherScope opened"
        );
        Ok(service)
    }

    /// A service that keeps models, jobs and features in memory only.
    pub fn in_memory(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::in_memory());
        let features: Arc<dyn FeatureStore> = Arc::new(MemoryFeatureCache::new(FEATURE_CACHE_CAPACITY));
        Ok(Self::assemble(config, registry, features, None))
    }

    fn assemble(
        config: Config,
        registry: Arc<ModelRegistry>,
        features: Arc<dyn FeatureStore>,
        db: Option<SharedDatabase>,
    ) -> Self {
        let orchestrator = TrainingOrchestrator::new(Arc::clone(&registry), config.trainer_settings());
        let runner = Arc::new(JobRunner::new(Arc::clone(&registry), orchestrator, features, config.classifier.clone()));
        let jobs = Arc::new(JobManager::new(JobSettings::from_config(&config.jobs), db));
        Self { config, registry, jobs, runner }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Validate an upload and queue a classification job.
    ///
    /// Rejected uploads return [`CipherScopeError::Validation`] and never
    /// create a job. Must be called from within a Tokio runtime.
    pub fn submit_classification(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        format: &str,
        known_algorithm: Option<&str>,
    ) -> Result<JobId> {
        self.submit_classification_as(None, bytes, format, known_algorithm)
    }

    /// [`submit_classification`](Self::submit_classification) on behalf of
    /// `owner`, recorded on the job.
    pub fn submit_classification_as(
        &self,
        owner: Option<&str>,
        bytes: impl Into<Arc<[u8]>>,
        format: &str,
        known_algorithm: Option<&str>,
    ) -> Result<JobId> {
        let dataset = Dataset::validated(bytes, format, self.config.limits.classification_max_bytes, None)
            .map_err(|rejection| {
                warn!(code = rejection.code(), %rejection, "Classification upload rejected");
                CipherScopeError::Validation(rejection)
            })?;

        let mut job = Job::new(JobKind::Classify, owner_of(owner));
        job.dataset_id = Some(dataset.id().clone());
        job.known_algorithm = known_algorithm.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        let known = job.known_algorithm.clone();
        let runner = Arc::clone(&self.runner);
        Ok(self.jobs.submit(job, move |ctx| runner.classify(ctx, dataset, known)))
    }

    /// Queue a training job. Only the request's shape is checked here; the
    /// samples themselves are validated in the job's first phase.
    pub fn submit_training(&self, request: TrainingRequest) -> Result<JobId> {
        self.submit_training_as(None, request)
    }

    pub fn submit_training_as(&self, owner: Option<&str>, request: TrainingRequest) -> Result<JobId> {
        request.validate().inspect_err(|e| warn!(error = %e, "Training request rejected"))?;

        let job = Job::new(JobKind::Train, owner_of(owner));
        let runner = Arc::clone(&self.runner);
        Ok(self.jobs.submit(job, move |ctx| runner.train(ctx, request)))
    }

    pub fn get_job_status(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self.jobs.get(id)?.status())
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.jobs.get(id)
    }

    /// Resolve once the job has completed, failed or been cancelled.
    pub async fn wait_for_job(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self.jobs.wait_for_terminal(id).await?.status())
    }

    pub fn cancel_job(&self, id: &JobId) -> Result<()> {
        self.jobs.cancel(id)
    }

    /// Jobs still held in memory, newest first.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<JobStatus> {
        self.jobs.list().iter().map(Job::status).collect()
    }

    /// Every persisted job, including ones from earlier processes.
    pub fn job_history(&self) -> Result<Vec<JobStatus>> {
        Ok(self.jobs.list_persisted()?.iter().map(Job::status).collect())
    }

    /// The bounded feature-visualization trace, oldest point first.
    pub fn feature_trace(&self, id: &JobId) -> Result<Vec<FeaturePoint>> {
        Ok(self.jobs.get(id)?.feature_trace.into_iter().collect())
    }

    pub fn submit_feedback(&self, id: &JobId, rating: Feedback) -> Result<()> {
        self.jobs.submit_feedback(id, rating)
    }

    /// Registered models in registration order.
    #[must_use]
    pub fn list_models(&self) -> Vec<Arc<Model>> {
        self.registry.list()
    }

    #[must_use]
    pub fn active_model(&self) -> Option<Arc<Model>> {
        self.registry.active()
    }

    /// Make a registered, validated model the one classification uses.
    ///
    /// On error the previously active model stays active.
    pub fn activate_model(&self, id: &ModelId) -> Result<()> {
        self.registry.activate(id).map_err(|e| {
            warn!(model_id = %id, error = %e, "Model activation refused");
            CipherScopeError::from(e)
        })
    }

    pub fn deactivate_model(&self) -> Result<()> {
        Ok(self.registry.deactivate()?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }

    /// Apply the job retention policy in the background.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.jobs.spawn_sweeper(Duration::from_secs(self.config.jobs.sweep_interval_secs))
    }
}

fn owner_of(owner: Option<&str>) -> Option<String> {
    owner.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
