//! Shared helpers for CipherScope integration tests.

#![allow(dead_code)]

use cipherscope_core::training::{ModelId, TrainingRequest, TrainingSample};
use cipherscope_core::{CipherScope, Config, JobId, JobResult, JobState, JobStatus};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Comma-separated hex bytes from a xorshift generator.
pub fn noisy_hex(seed: u8, len: usize) -> Vec<u8> {
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

/// Low-entropy text with a short repeating period.
pub fn patterned(len: usize) -> Vec<u8> {
    let mut out = b"0011223344556677".repeat(len / 16);
    out.push(b'\n');
    out
}

pub fn aes_rsa_request() -> TrainingRequest {
    TrainingRequest::new(vec![
        TrainingSample::new("AES", "csv", noisy_hex(7, 2048)),
        TrainingSample::new("RSA", "txt", patterned(2048)),
    ])
}

pub fn memory_service(config: Config) -> CipherScope {
    init_tracing();
    CipherScope::in_memory(config).expect("in-memory service")
}

/// Train on [`aes_rsa_request`] and activate the result.
pub async fn train_and_activate(service: &CipherScope) -> ModelId {
    let id = service.submit_training(aes_rsa_request()).expect("submit training");
    let status = service.wait_for_job(&id).await.expect("training finishes");
    assert_eq!(status.state, JobState::Completed, "training failed: {:?}", status.failure);

    let Some(JobResult::Training(summary)) = status.result else {
        panic!("expected a training summary, got {:?}", status.result);
    };
    service.activate_model(&summary.model_id).expect("activate");
    summary.model_id
}

/// Poll the job until `ready` holds. Panics if the job finishes first or the
/// condition is not reached within a few seconds.
pub async fn wait_until(service: &CipherScope, id: &JobId, ready: impl Fn(&JobStatus) -> bool) -> JobStatus {
    let poll = async {
        loop {
            let status = service.get_job_status(id).expect("job exists");
            if ready(&status) {
                return status;
            }
            assert!(!status.state.is_terminal(), "job finished early: {:?}", status.state);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), poll).await.expect("condition reached in time")
}
