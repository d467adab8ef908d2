//! The per-job record owned by the job manager.

use crate::jobs::state::{FailureReason, JobKind, JobState, PhaseWeights};
use chrono::{DateTime, Utc};
use cipherscope_training::{ClassificationResult, DatasetId, FeatureSample, TrainingSummary};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Classification(ClassificationResult),
    Training(TrainingSummary),
}

/// One point of the feature visualization stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePoint {
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub processed_bytes: u64,
    pub entropy: f64,
    pub block_repetition: f64,
    pub recorded_at: DateTime<Utc>,
}

impl FeaturePoint {
    #[must_use]
    pub fn from_sample(sample: FeatureSample, label: Option<String>) -> Self {
        Self {
            sequence: 0,
            label,
            processed_bytes: sample.processed_bytes,
            entropy: sample.entropy,
            block_repetition: sample.block_repetition,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Up,
    Down,
}

impl std::str::FromStr for Feedback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "+" | "yes" => Ok(Self::Up),
            "down" | "-" | "no" => Ok(Self::Down),
            other => Err(format!("unknown feedback '{other}' (expected up or down)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub rating: Feedback,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    /// Progress within the current phase, 0..=100.
    pub phase_progress: f64,
    /// Weighted progress across all phases, 0..=100.
    pub progress: f64,
    #[serde(default)]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    #[serde(default)]
    pub known_algorithm: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub feature_trace: VecDeque<FeaturePoint>,
    #[serde(default)]
    pub feedback: Option<FeedbackRecord>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(skip)]
    trace_sequence: u64,
}

impl Job {
    #[must_use]
    pub fn new(kind: JobKind, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            state: JobState::Queued,
            phase_progress: 0.0,
            progress: 0.0,
            owner,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            dataset_id: None,
            known_algorithm: None,
            result: None,
            feature_trace: VecDeque::new(),
            feedback: None,
            cancel_requested: false,
            trace_sequence: 0,
        }
    }

    /// Apply a transition already checked with `can_transition_to`.
    pub(crate) fn apply_transition(&mut self, next: JobState, weights: &PhaseWeights) {
        let now = Utc::now();
        if self.started_at.is_none() && !matches!(next, JobState::Queued) {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }

        self.state = next;
        match self.state {
            JobState::Completed => {
                self.phase_progress = 100.0;
                self.progress = 100.0;
            }
            JobState::Failed(_) | JobState::Cancelled => {}
            _ => {
                self.phase_progress = 0.0;
                self.progress = self.progress.max(weights.overall(self.kind, &self.state, 0.0));
            }
        }
        self.updated_at = now;
    }

    /// Raise phase progress. Lower values are ignored so progress never moves
    /// backwards within a phase. Returns whether anything changed.
    pub(crate) fn advance_progress(&mut self, percent: f64, weights: &PhaseWeights) -> bool {
        if self.state.is_terminal() || matches!(self.state, JobState::Queued) {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent <= self.phase_progress {
            return false;
        }
        self.phase_progress = percent;
        self.progress = self.progress.max(weights.overall(self.kind, &self.state, percent));
        self.updated_at = Utc::now();
        true
    }

    /// Append to the bounded feature trace, dropping the oldest points.
    pub(crate) fn push_trace(&mut self, mut point: FeaturePoint, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.trace_sequence = self.trace_sequence.max(self.feature_trace.back().map_or(0, |p| p.sequence + 1));
        point.sequence = self.trace_sequence;
        self.trace_sequence += 1;
        self.feature_trace.push_back(point);
        while self.feature_trace.len() > capacity {
            self.feature_trace.pop_front();
        }
    }

    /// Drop data that is only kept for visualization.
    pub(crate) fn clear_transient(&mut self) -> bool {
        let mut changed = !self.feature_trace.is_empty();
        self.feature_trace.clear();
        if let Some(JobResult::Training(summary)) = &mut self.result {
            changed |= !summary.feature_vectors.is_empty();
            summary.feature_vectors.clear();
        }
        changed
    }

    /// Copy suitable for durable storage.
    #[must_use]
    pub fn persistable(&self) -> Self {
        let mut copy = self.clone();
        copy.clear_transient();
        copy
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            kind: self.kind,
            owner: self.owner.clone(),
            state: self.state.clone(),
            phase_progress: self.phase_progress,
            progress: self.progress,
            eta_secs: self.eta_secs(Utc::now()),
            cancel_requested: self.cancel_requested,
            failure: self.state.failure().cloned(),
            result: self.result.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Remaining time extrapolated from elapsed time and weighted progress.
    #[must_use]
    pub fn eta_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.state.is_terminal() || self.progress <= 0.0 {
            return None;
        }
        let started = self.started_at?;
        let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
        Some(elapsed * (100.0 - self.progress) / self.progress)
    }
}

/// Snapshot returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub state: JobState,
    pub phase_progress: f64,
    pub progress: f64,
    pub eta_secs: Option<f64>,
    pub cancel_requested: bool,
    pub failure: Option<FailureReason>,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(entropy: f64) -> FeaturePoint {
        FeaturePoint::from_sample(FeatureSample { processed_bytes: 1, entropy, block_repetition: 0.0 }, None)
    }

    #[test]
    fn test_progress_is_monotonic_within_phase() {
        let weights = PhaseWeights::default();
        let mut job = Job::new(JobKind::Classify, None);
        job.apply_transition(JobState::Validating, &weights);
        job.apply_transition(JobState::Extracting, &weights);

        assert!(job.advance_progress(40.0, &weights));
        assert!(!job.advance_progress(20.0, &weights));
        assert_eq!(job.phase_progress, 40.0);
        assert!((job.progress - 38.0).abs() < 1e-9);
    }

    #[test]
    fn test_phase_progress_resets_on_transition() {
        let weights = PhaseWeights::default();
        let mut job = Job::new(JobKind::Classify, None);
        job.apply_transition(JobState::Validating, &weights);
        job.advance_progress(100.0, &weights);
        job.apply_transition(JobState::Extracting, &weights);
        assert_eq!(job.phase_progress, 0.0);
        assert!((job.progress - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_keeps_last_progress() {
        let weights = PhaseWeights::default();
        let mut job = Job::new(JobKind::Classify, None);
        job.apply_transition(JobState::Validating, &weights);
        job.advance_progress(50.0, &weights);
        job.apply_transition(JobState::Failed(FailureReason::NoActiveModel), &weights);
        assert!((job.progress - 5.0).abs() < 1e-9);
        assert!(job.finished_at.is_some());
        assert!(!job.advance_progress(90.0, &weights));
    }

    #[test]
    fn test_trace_is_bounded() {
        let mut job = Job::new(JobKind::Classify, None);
        for i in 0..15 {
            job.push_trace(point(f64::from(i)), 10);
        }
        assert_eq!(job.feature_trace.len(), 10);
        assert_eq!(job.feature_trace.front().unwrap().sequence, 5);
        assert_eq!(job.feature_trace.back().unwrap().entropy, 14.0);
    }

    #[test]
    fn test_persistable_drops_trace() {
        let mut job = Job::new(JobKind::Classify, None);
        job.push_trace(point(0.5), 10);
        assert!(job.persistable().feature_trace.is_empty());
        assert_eq!(job.feature_trace.len(), 1);
    }

    #[test]
    fn test_feedback_parse() {
        assert_eq!("UP".parse::<Feedback>(), Ok(Feedback::Up));
        assert_eq!("down".parse::<Feedback>(), Ok(Feedback::Down));
        assert!("sideways".parse::<Feedback>().is_err());
    }
}
