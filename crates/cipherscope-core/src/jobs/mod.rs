//! Asynchronous classification and training jobs.

mod manager;
mod record;
mod runner;
mod state;

pub use manager::{JobContext, JobEvent, JobFailure, JobManager, JobSettings};
pub use record::{FeaturePoint, Feedback, FeedbackRecord, Job, JobId, JobResult, JobStatus};
pub use runner::JobRunner;
pub use state::{ClassifyWeights, FailureReason, JobKind, JobState, PhaseWeights, TrainWeights};
