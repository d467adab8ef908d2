//! Classification jobs end to end.

mod common;

use cipherscope_core::training::{Rejection, UNKNOWN_LABEL};
use cipherscope_core::{CipherScopeError, Config, FailureReason, Feedback, JobEvent, JobId, JobResult, JobState};
use common::{memory_service, noisy_hex, patterned, train_and_activate};

#[tokio::test]
async fn test_oversized_upload_is_rejected_without_a_job() {
    let service = memory_service(Config::default());
    let bytes = vec![b'a'; 15 * 1024 * 1024];

    let err = service.submit_classification(bytes, "txt", None).unwrap_err();

    assert!(matches!(err, CipherScopeError::Validation(Rejection::FileTooLarge { .. })));
    assert_eq!(err.code(), "validation_error");
    assert!(service.list_jobs().is_empty());
}

#[tokio::test]
async fn test_unsupported_format_is_rejected() {
    let service = memory_service(Config::default());
    let err = service.submit_classification(b"%PDF-1.4".to_vec(), "pdf", None).unwrap_err();
    assert!(matches!(err, CipherScopeError::Validation(Rejection::UnsupportedFormat { .. })));
}

#[tokio::test]
async fn test_classification_without_active_model_fails() {
    let service = memory_service(Config::default());
    let id = service.submit_classification(noisy_hex(1, 512), "csv", None).unwrap();

    let status = service.wait_for_job(&id).await.unwrap();

    assert_eq!(status.state, JobState::Failed(FailureReason::NoActiveModel));
    assert_eq!(status.failure.as_ref().map(FailureReason::code), Some("no_active_model"));
    assert!(status.result.is_none());
}

#[tokio::test]
async fn test_classifies_with_the_active_model() {
    let service = memory_service(Config::default());
    let model_id = train_and_activate(&service).await;

    let id = service.submit_classification(noisy_hex(7, 2048), "csv", Some("aes")).unwrap();
    let status = service.wait_for_job(&id).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert!((status.progress - 100.0).abs() < 1e-9);
    let Some(JobResult::Classification(result)) = status.result else {
        panic!("expected a classification result");
    };
    assert_eq!(result.model_id, model_id);
    assert_eq!(result.label, "AES");
    assert_eq!(result.matches_expected, Some(true));
    assert!(!result.out_of_distribution);

    let total: f64 = result.distribution.iter().map(|p| p.probability).sum();
    assert!((total - 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_far_from_training_data_is_unknown() {
    let service = memory_service(Config::default());
    train_and_activate(&service).await;

    let far = format!("{{\"ciphertext\": \"{}\"}}", "z".repeat(4096)).into_bytes();
    let id = service.submit_classification(far, "json", None).unwrap();
    let status = service.wait_for_job(&id).await.unwrap();

    let Some(JobResult::Classification(result)) = status.result else {
        panic!("expected a classification result, got {:?}", status.state);
    };
    assert!(result.out_of_distribution);
    assert_eq!(result.label, UNKNOWN_LABEL);
    assert!(result.confidence < service.config().classifier.unknown_confidence_cap);
    assert_eq!(result.distribution[0].label, UNKNOWN_LABEL);
}

#[tokio::test]
async fn test_feature_trace_is_bounded() {
    let mut config = Config::default();
    config.jobs.feature_trace_len = 3;
    config.extraction.chunk_size = 128;
    let service = memory_service(config);
    train_and_activate(&service).await;

    let id = service.submit_classification(patterned(4096), "txt", None).unwrap();
    service.wait_for_job(&id).await.unwrap();

    let trace = service.feature_trace(&id).unwrap();
    assert!(!trace.is_empty());
    assert!(trace.len() <= 3);
    assert!(trace.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn test_feedback_on_completed_classification() {
    let service = memory_service(Config::default());
    train_and_activate(&service).await;

    let id = service.submit_classification(patterned(1024), "txt", Some("RSA")).unwrap();
    service.wait_for_job(&id).await.unwrap();

    service.submit_feedback(&id, Feedback::Up).unwrap();
    let job = service.get_job(&id).unwrap();
    assert_eq!(job.feedback.map(|f| f.rating), Some(Feedback::Up));

    assert!(matches!(
        service.submit_feedback(&JobId::from("missing"), Feedback::Down),
        Err(CipherScopeError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_feedback_on_failed_job_is_refused() {
    let service = memory_service(Config::default());
    let id = service.submit_classification(noisy_hex(1, 256), "csv", None).unwrap();
    service.wait_for_job(&id).await.unwrap();

    let err = service.submit_feedback(&id, Feedback::Down).unwrap_err();
    assert_eq!(err.code(), "invalid_state");
}

#[tokio::test]
async fn test_overall_progress_never_decreases() {
    let mut config = Config::default();
    config.extraction.chunk_size = 64;
    let service = memory_service(config);
    train_and_activate(&service).await;

    let mut events = service.subscribe();
    let id = service.submit_classification(noisy_hex(9, 4096), "csv", None).unwrap();
    service.wait_for_job(&id).await.unwrap();

    let mut last = 0.0;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Progress { id: event_id, progress, .. } = event {
            if event_id == id {
                assert!(progress >= last, "progress went from {last} to {progress}");
                last = progress;
            }
        }
    }
    assert!(last > 0.0);
}
