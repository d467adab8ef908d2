//! Job manager.
//!
//! Each job's record lives in its own `watch` channel: the job's task is the
//! only writer of its state, while pollers clone snapshots. Jobs run in
//! spawned tasks gated by a semaphore and observe cancellation only at
//! checkpoints.

use crate::config::JobsConfig;
use crate::error::{CipherScopeError, Result};
use crate::jobs::record::{FeaturePoint, Feedback, FeedbackRecord, Job, JobId, JobResult};
use crate::jobs::state::{FailureReason, JobKind, JobState, PhaseWeights};
use crate::storage::{JobRepository, SharedDatabase, SqliteJobRepository};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub max_concurrent: usize,
    pub weights: PhaseWeights,
    pub feature_trace_len: usize,
    pub retention: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from_config(&JobsConfig::default())
    }
}

impl JobSettings {
    #[must_use]
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            weights: config.weights.clone(),
            feature_trace_len: config.feature_trace_len,
            retention: Duration::from_secs(config.retention_secs),
        }
    }
}

/// Push notifications for subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Created { id: JobId, kind: JobKind },
    StateChanged { id: JobId, state: JobState },
    Progress { id: JobId, progress: f64, phase_progress: f64 },
    FeaturePoint { id: JobId, point: FeaturePoint },
}

/// How a job's work ended, short of success.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    Cancelled,
    Failed(FailureReason),
}

impl From<FailureReason> for JobFailure {
    fn from(reason: FailureReason) -> Self {
        Self::Failed(reason)
    }
}

struct JobHandle {
    tx: watch::Sender<Job>,
    cancel: CancellationToken,
}

pub struct JobManager {
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    db: Option<SharedDatabase>,
    settings: JobSettings,
}

impl JobManager {
    #[must_use]
    pub fn new(settings: JobSettings, db: Option<SharedDatabase>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            events,
            db,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Mark jobs left unfinished by a previous process as interrupted.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut repo = SqliteJobRepository::new(&mut db);

        let unfinished = repo.get_unfinished()?;
        for mut job in unfinished.iter().cloned() {
            warn!(job_id = %job.id, state = %job.state, "Job interrupted by restart");
            job.apply_transition(JobState::Failed(FailureReason::Interrupted), &self.settings.weights);
            repo.upsert(&job)?;
        }
        Ok(unfinished.len())
    }

    /// Register a job and run `work` for it once a slot is free.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<F, Fut>(self: &Arc<Self>, job: Job, work: F) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<JobResult, JobFailure>> + Send + 'static,
    {
        let id = job.id.clone();
        let kind = job.kind;
        self.persist(&job);

        let (tx, _) = watch::channel(job);
        let handle = Arc::new(JobHandle { tx, cancel: CancellationToken::new() });
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&handle));

        info!(job_id = %id, %kind, "Job submitted");
        let _ = self.events.send(JobEvent::Created { id: id.clone(), kind });

        self.spawn(handle, id.clone(), work);
        id
    }

    fn spawn<F, Fut>(self: &Arc<Self>, handle: Arc<JobHandle>, id: JobId, work: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<JobResult, JobFailure>> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                () = handle.cancel.cancelled() => None,
                permit = Arc::clone(&manager.permits).acquire_owned() => Some(permit),
            };

            let outcome = match permit {
                None => Err(JobFailure::Cancelled),
                Some(Err(_)) => Err(JobFailure::Failed(FailureReason::internal("job queue closed"))),
                Some(Ok(_permit)) => {
                    let ctx = JobContext { manager: Arc::clone(&manager), handle: Arc::clone(&handle), id };
                    match tokio::spawn(work(ctx)).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(JobFailure::Failed(FailureReason::internal(format!("job task failed: {e}")))),
                    }
                }
            };

            manager.finish(&handle, outcome);
        });
    }

    fn handle(&self, id: &JobId) -> Option<Arc<JobHandle>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn persist(&self, job: &Job) {
        if let Some(db) = &self.db {
            let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = SqliteJobRepository::new(&mut db).upsert(job) {
                error!(job_id = %job.id, error = %e, "Failed to persist job");
            }
        }
    }

    fn load(&self, id: &JobId) -> Option<Job> {
        let db = self.db.as_ref()?;
        let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
        SqliteJobRepository::new(&mut db).get_by_id(id).ok()
    }

    fn transition(&self, handle: &JobHandle, next: JobState) -> Result<()> {
        let weights = &self.settings.weights;
        let mut rejected = None;
        handle.tx.send_if_modified(|job| {
            if job.state.can_transition_to(job.kind, &next) {
                job.apply_transition(next.clone(), weights);
                true
            } else {
                rejected = Some(job.state.clone());
                false
            }
        });

        let job = handle.tx.borrow().clone();
        if let Some(current) = rejected {
            error!(job_id = %job.id, from = %current, to = %next, "Invalid job state transition");
            return Err(CipherScopeError::InvalidState(format!("cannot move job from {current} to {next}")));
        }

        info!(job_id = %job.id, state = %job.state, progress = job.progress, "Job state changed");
        self.persist(&job);
        let _ = self.events.send(JobEvent::StateChanged { id: job.id, state: job.state });
        Ok(())
    }

    fn finish(&self, handle: &JobHandle, outcome: std::result::Result<JobResult, JobFailure>) {
        let (next, result) = match outcome {
            Ok(result) => (JobState::Completed, Some(result)),
            Err(JobFailure::Cancelled) => (JobState::Cancelled, None),
            Err(JobFailure::Failed(reason)) => (JobState::Failed(reason), None),
        };

        let weights = &self.settings.weights;
        let mut applied = false;
        handle.tx.send_if_modified(|job| {
            let next = if next == JobState::Completed && !job.state.can_transition_to(job.kind, &next) {
                JobState::Failed(FailureReason::internal(format!("job finished early in {}", job.state)))
            } else {
                next
            };
            if !job.state.can_transition_to(job.kind, &next) {
                return false;
            }
            if next == JobState::Completed {
                job.result = result;
            }
            job.apply_transition(next, weights);
            // Durable before any waiter can observe the terminal state.
            self.persist(job);
            applied = true;
            true
        });
        if !applied {
            return;
        }

        let job = handle.tx.borrow().clone();
        match &job.state {
            JobState::Failed(reason @ FailureReason::InternalError { .. }) => {
                error!(job_id = %job.id, code = reason.code(), %reason, "Job failed");
            }
            JobState::Failed(reason) => warn!(job_id = %job.id, code = reason.code(), %reason, "Job failed"),
            state => info!(job_id = %job.id, %state, "Job finished"),
        }
        let _ = self.events.send(JobEvent::StateChanged { id: job.id, state: job.state });
    }

    fn report_progress(&self, handle: &JobHandle, percent: f64) {
        let weights = &self.settings.weights;
        if handle.tx.send_if_modified(|job| job.advance_progress(percent, weights)) {
            let job = handle.tx.borrow();
            debug!(job_id = %job.id, state = %job.state, phase_progress = job.phase_progress, "Job progress");
            let _ = self.events.send(JobEvent::Progress {
                id: job.id.clone(),
                progress: job.progress,
                phase_progress: job.phase_progress,
            });
        }
    }

    fn record_trace(&self, handle: &JobHandle, point: FeaturePoint) {
        let capacity = self.settings.feature_trace_len;
        handle.tx.send_modify(|job| job.push_trace(point, capacity));
        let job = handle.tx.borrow();
        if let Some(point) = job.feature_trace.back() {
            let _ = self.events.send(JobEvent::FeaturePoint { id: job.id.clone(), point: point.clone() });
        }
    }

    /// Snapshot of a job, falling back to durable storage for evicted jobs.
    pub fn get(&self, id: &JobId) -> Result<Job> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.tx.borrow().clone());
        }
        self.load(id).ok_or_else(|| CipherScopeError::JobNotFound(id.clone()))
    }

    /// Request cancellation. Unknown ids are `JobNotFound`; finished jobs are
    /// left untouched and the call still succeeds.
    pub fn cancel(&self, id: &JobId) -> Result<()> {
        let Some(handle) = self.handle(id) else {
            if self.load(id).is_some_and(|job| job.state.is_terminal()) {
                return Ok(());
            }
            warn!(job_id = %id, "Cancellation requested for unknown job");
            return Err(CipherScopeError::JobNotFound(id.clone()));
        };

        let mut terminal = false;
        handle.tx.send_if_modified(|job| {
            if job.state.is_terminal() {
                terminal = true;
                return false;
            }
            if job.cancel_requested {
                return false;
            }
            job.cancel_requested = true;
            job.updated_at = Utc::now();
            true
        });

        if terminal {
            debug!(job_id = %id, "Cancel ignored for finished job");
            return Ok(());
        }
        handle.cancel.cancel();
        info!(job_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: &JobId) -> Result<Job> {
        let Some(handle) = self.handle(id) else {
            return self.get(id);
        };
        let mut rx = handle.tx.subscribe();
        let job = rx
            .wait_for(|job| job.state.is_terminal())
            .await
            .map_err(|_| CipherScopeError::InvalidState(format!("job {id} was dropped")))?
            .clone();
        Ok(job)
    }

    /// In-memory jobs, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|h| h.tx.borrow().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        jobs
    }

    /// Every job ever persisted, newest first. Without storage this is `list`.
    pub fn list_persisted(&self) -> Result<Vec<Job>> {
        let Some(db) = &self.db else {
            return Ok(self.list());
        };
        let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(SqliteJobRepository::new(&mut db).get_all()?)
    }

    /// Record thumbs up/down on a completed classification.
    pub fn submit_feedback(&self, id: &JobId, rating: Feedback) -> Result<()> {
        let apply = |job: &mut Job| -> Result<()> {
            if job.kind != JobKind::Classify || job.state != JobState::Completed {
                return Err(CipherScopeError::InvalidState(format!(
                    "feedback is only accepted on completed classifications (job {} is {} {})",
                    job.id, job.kind, job.state
                )));
            }
            job.feedback = Some(FeedbackRecord { rating, recorded_at: Utc::now() });
            job.updated_at = Utc::now();
            Ok(())
        };

        let job = if let Some(handle) = self.handle(id) {
            let mut outcome = Ok(());
            handle.tx.send_if_modified(|job| {
                outcome = apply(job);
                outcome.is_ok()
            });
            outcome?;
            handle.tx.borrow().clone()
        } else {
            let mut job = self.load(id).ok_or_else(|| CipherScopeError::JobNotFound(id.clone()))?;
            apply(&mut job)?;
            job
        };

        info!(job_id = %id, ?rating, "Feedback recorded");
        self.persist(&job);
        Ok(())
    }

    /// Apply the retention policy at `now`. Returns `(cleared, evicted)`.
    ///
    /// After one retention window a finished job loses its transient data;
    /// after two it is dropped from memory but stays in storage.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> (usize, usize) {
        let retention = self.settings.retention;
        let mut cleared = 0;
        let mut expired = Vec::new();
        {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            for (id, handle) in jobs.iter() {
                let finished_at = handle.tx.borrow().finished_at;
                let Some(finished_at) = finished_at else {
                    continue;
                };
                let age = (now - finished_at).to_std().unwrap_or_default();
                if age >= retention.saturating_mul(2) {
                    expired.push(id.clone());
                } else if age >= retention && handle.tx.send_if_modified(Job::clear_transient) {
                    cleared += 1;
                }
            }
        }

        if !expired.is_empty() {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            for id in &expired {
                jobs.remove(id);
            }
        }

        if cleared + expired.len() > 0 {
            debug!(cleared, evicted = expired.len(), "Retention sweep");
        }
        (cleared, expired.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) periodically until the
    /// manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = interval.clamp(Duration::from_millis(10), Duration::from_secs(86_400));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.purge_expired(Utc::now());
            }
        })
    }
}

/// Handle given to a job's work future.
#[derive(Clone)]
pub struct JobContext {
    manager: Arc<JobManager>,
    handle: Arc<JobHandle>,
    id: JobId,
}

impl JobContext {
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.handle.cancel.clone()
    }

    pub fn checkpoint(&self) -> std::result::Result<(), JobFailure> {
        if self.handle.cancel.is_cancelled() {
            debug!(job_id = %self.id, "Cancellation observed at checkpoint");
            return Err(JobFailure::Cancelled);
        }
        Ok(())
    }

    /// Checkpoint, then move to the next phase.
    pub fn enter(&self, state: JobState) -> std::result::Result<(), JobFailure> {
        self.checkpoint()?;
        self.advance(state).map_err(|e| JobFailure::Failed(FailureReason::internal(e)))
    }

    /// Move to the next phase without a cancellation check.
    pub fn advance(&self, state: JobState) -> Result<()> {
        self.manager.transition(&self.handle, state)
    }

    pub fn progress(&self, percent: f64) {
        self.manager.report_progress(&self.handle, percent);
    }

    pub fn trace(&self, point: FeaturePoint) {
        self.manager.record_trace(&self.handle, point);
    }

    #[must_use]
    pub fn snapshot(&self) -> Job {
        self.handle.tx.borrow().clone()
    }
}
