//! Lifecycle integration tests: submission, throttling, retry/DLQ
//! accounting, reconciliation, and the operator surface.

use assert_matches::assert_matches;
use chrono::Utc;
use rowmill_core::{EngineConfig, EngineError};
use rowmill_engine::Engine;
use rowmill_pipeline::OutputResult;
use rowmill_store::models::{
    DerivedStatus, InputMode, JobEventType, JobFilter, JobInput, JobStatus, SubmitRequest,
};
use serde_json::json;

/// Unlimited budgets, instant retries: lifecycle tests control timing
/// through explicit sweeps rather than real delays.
fn config() -> EngineConfig {
    EngineConfig {
        jobs_per_min_limit: 0,
        concurrent_jobs_limit: 0,
        retry_delay_secs: 0,
        ..EngineConfig::default()
    }
}

fn request(account_id: i64, label: &str) -> SubmitRequest {
    SubmitRequest {
        account_id,
        label: label.to_string(),
        input: JobInput {
            rows: vec![json!({"id": 1, "email": "a@x.com"}), json!({"id": 2, "email": "b@x.com"})],
            ..JobInput::default()
        },
        idempotency_key: None,
        max_attempts: None,
    }
}

#[tokio::test]
async fn third_submission_is_throttled_at_concurrency_limit() {
    let engine = Engine::new(EngineConfig {
        concurrent_jobs_limit: 2,
        jobs_per_min_limit: 0,
        ..EngineConfig::default()
    });

    let first = engine.admission.submit(request(1, "one")).await.unwrap();
    let second = engine.admission.submit(request(1, "two")).await.unwrap();
    let third = engine.admission.submit(request(1, "three")).await.unwrap();

    assert!(first.admitted);
    assert!(second.admitted);
    assert!(!third.admitted);
    assert_eq!(third.job.status, JobStatus::Throttled);
    assert!(third.job.next_run_at.is_some());
    assert_eq!(third.job.attempts, 0);
    assert!(third
        .job
        .events
        .iter()
        .any(|e| e.event_type == JobEventType::Throttled));
}

#[tokio::test]
async fn resubmitting_the_same_idempotency_key_returns_the_same_job() {
    let engine = Engine::new(config());
    let mut req = request(1, "import");
    req.idempotency_key = Some("batch-2024-01".into());

    let first = engine.admission.submit(req.clone()).await.unwrap();
    let second = engine.admission.submit(req).await.unwrap();
    assert_eq!(first.job.id, second.job.id);
    assert!(second.deduplicated);
}

#[tokio::test]
async fn uploaded_file_submissions_carry_their_source() {
    let engine = Engine::new(config());
    let mut req = request(1, "csv import");
    req.input.mode = InputMode::File;
    req.input.source_file = Some("customers.csv".into());

    let job = engine.admission.submit(req).await.unwrap().job;
    assert_eq!(job.input.mode, InputMode::File);
    assert_eq!(job.input.source_file.as_deref(), Some("customers.csv"));
    assert_eq!(job.total_rows, 2);
}

#[tokio::test]
async fn submissions_are_validated() {
    let engine = Engine::new(config());
    let err = engine.admission.submit(request(1, "")).await.unwrap_err();
    assert_matches!(err, EngineError::Validation(_));

    let mut req = request(1, "zero attempts");
    req.max_attempts = Some(0);
    let err = engine.admission.submit(req).await.unwrap_err();
    assert_matches!(err, EngineError::Validation(_));
}

#[tokio::test]
async fn three_failures_move_the_job_to_dlq() {
    let engine = Engine::new(config());
    let mut req = request(1, "flaky");
    req.max_attempts = Some(3);
    let job_id = engine.admission.submit(req).await.unwrap().job.id;

    for attempt in 1..=3u32 {
        let leased = engine.lease.lease("w1").await.unwrap().expect("job leasable");
        assert_eq!(leased.id, job_id);
        let failed = engine.lease.fail(job_id, "w1", "pipeline blew up").await.unwrap();
        assert_eq!(failed.attempts, attempt);

        if attempt < 3 {
            assert_eq!(failed.status, JobStatus::Failed);
            // Retry delay is zero in this config, so one sweep requeues it.
            let report = engine.reconciler.sweep_once(Utc::now()).await;
            assert_eq!(report.promoted_retries, 1);
        } else {
            assert_eq!(failed.status, JobStatus::Dlq);
        }
    }

    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dlq);
    assert_eq!(job.attempts, 3);
    assert!(job.failure_reason.is_some());
    assert!(job
        .events
        .iter()
        .any(|e| e.event_type == JobEventType::MovedToDlq));
}

#[tokio::test]
async fn expired_leases_are_reconciled_into_retries() {
    let engine = Engine::new(EngineConfig {
        lease_secs: 0,
        retry_delay_secs: 300,
        jobs_per_min_limit: 0,
        concurrent_jobs_limit: 0,
        ..EngineConfig::default()
    });
    let job_id = engine.admission.submit(request(1, "abandoned")).await.unwrap().job.id;

    // Worker leases and then never reports back.
    engine.lease.lease("w1").await.unwrap().expect("job leasable");

    let report = engine.reconciler.sweep_once(Utc::now()).await;
    assert_eq!(report.expired_leases, 1);

    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.failure_reason.as_deref(), Some("worker lease expired"));
    assert!(job.locked_by.is_none());
    assert!(job.next_retry_at.is_some());
    assert_eq!(job.derived_status(), DerivedStatus::Retrying);

    // The stale worker's late report is rejected with the expiry error.
    let err = engine
        .lease
        .complete(job_id, "w1", OutputResult::default())
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::LeaseExpired { .. });

    // Expiry is idempotent: a second sweep finds nothing to do.
    let report = engine.reconciler.sweep_once(Utc::now()).await;
    assert_eq!(report.expired_leases, 0);
    assert_eq!(report.promoted_retries, 0);
}

#[tokio::test]
async fn failed_jobs_present_as_retrying_until_promoted() {
    let engine = Engine::new(EngineConfig {
        retry_delay_secs: 300,
        jobs_per_min_limit: 0,
        concurrent_jobs_limit: 0,
        ..EngineConfig::default()
    });
    let job_id = engine.admission.submit(request(1, "slow retry")).await.unwrap().job.id;

    engine.lease.lease("w1").await.unwrap().expect("job leasable");
    engine.lease.fail(job_id, "w1", "transient").await.unwrap();

    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.derived_status(), DerivedStatus::Retrying);

    // Not due for five minutes: the sweep leaves it alone.
    let report = engine.reconciler.sweep_once(Utc::now()).await;
    assert_eq!(report.promoted_retries, 0);
}

#[tokio::test]
async fn replaying_a_dlq_job_resets_attempts() {
    let engine = Engine::new(config());
    let mut req = request(1, "doomed");
    req.max_attempts = Some(1);
    let job_id = engine.admission.submit(req).await.unwrap().job.id;

    engine.lease.lease("w1").await.unwrap().expect("job leasable");
    let dead = engine.lease.fail(job_id, "w1", "fatal").await.unwrap();
    assert_eq!(dead.status, JobStatus::Dlq);
    assert_eq!(dead.attempts, 1);

    let replayed = engine.service.replay(1, job_id).await.unwrap();
    assert_eq!(replayed.status, JobStatus::Pending);
    assert_eq!(replayed.attempts, 0);
    assert_eq!(replayed.max_attempts, 1);
}

#[tokio::test]
async fn retrying_a_done_job_starts_a_fresh_cycle() {
    let engine = Engine::new(config());
    let job_id = engine.admission.submit(request(1, "rerun me")).await.unwrap().job.id;

    engine.lease.lease("w1").await.unwrap().expect("job leasable");
    engine
        .lease
        .complete(job_id, "w1", OutputResult::default())
        .await
        .unwrap();

    let retried = engine.service.retry(1, job_id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(retried.output.is_none());

    // A PENDING job cannot be retried again.
    let err = engine.service.retry(1, job_id).await.unwrap_err();
    assert_matches!(err, EngineError::InvalidState { .. });
}

#[tokio::test]
async fn force_fail_consumes_an_attempt() {
    let engine = Engine::new(config());
    let job_id = engine.admission.submit(request(1, "stuck")).await.unwrap().job.id;
    engine.lease.lease("w1").await.unwrap().expect("job leasable");

    let failed = engine
        .service
        .force_fail(1, job_id, "operator intervention")
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.failure_reason.as_deref(), Some("operator intervention"));

    // Only RUNNING jobs can be force-failed.
    let err = engine.service.force_fail(1, job_id, "again").await.unwrap_err();
    assert_matches!(err, EngineError::InvalidState { .. });
}

#[tokio::test]
async fn event_log_records_the_full_timeline() {
    let engine = Engine::new(config());
    let job_id = engine.admission.submit(request(1, "audited")).await.unwrap().job.id;

    engine.lease.lease("w1").await.unwrap().expect("job leasable");
    engine
        .lease
        .report_progress(job_id, "w1", 1, rowmill_store::models::JobStage::Processing)
        .await
        .unwrap();
    engine
        .lease
        .complete(job_id, "w1", OutputResult::default())
        .await
        .unwrap();

    let job = engine.service.get(1, job_id).await.unwrap();
    let types: Vec<JobEventType> = job.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            JobEventType::Submitted,
            JobEventType::Leased,
            JobEventType::ProgressUpdated,
            JobEventType::Done,
        ]
    );
}

#[tokio::test]
async fn stats_reflect_states_and_utilization() {
    let engine = Engine::new(EngineConfig {
        concurrent_jobs_limit: 2,
        jobs_per_min_limit: 4,
        ..EngineConfig::default()
    });
    for label in ["a", "b"] {
        engine.admission.submit(request(1, label)).await.unwrap();
    }
    engine.admission.submit(request(1, "c")).await.unwrap(); // throttled
    engine.lease.lease("w1").await.unwrap().expect("job leasable");

    let stats = engine.service.stats(1).await;
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.throttled, 1);
    assert_eq!(stats.concurrent_jobs, 1);
    assert_eq!(stats.concurrent_jobs_limit, 2);
    assert_eq!(stats.jobs_per_min, 1);
    assert_eq!(stats.jobs_per_min_limit, 4);
}

#[tokio::test]
async fn listing_is_scoped_and_filterable() {
    let engine = Engine::new(config());
    engine.admission.submit(request(1, "mine")).await.unwrap();
    engine.admission.submit(request(2, "theirs")).await.unwrap();

    let mine = engine.service.list(1, &JobFilter::default()).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].label, "mine");

    let running_only = engine
        .service
        .list(
            1,
            &JobFilter {
                status: Some(JobStatus::Running),
                ..JobFilter::default()
            },
        )
        .await;
    assert!(running_only.is_empty());
}

#[tokio::test]
async fn try_admit_for_run_probes_capacity() {
    let engine = Engine::new(EngineConfig {
        concurrent_jobs_limit: 1,
        jobs_per_min_limit: 0,
        ..EngineConfig::default()
    });
    let first = engine.admission.submit(request(1, "a")).await.unwrap().job.id;
    assert!(engine.admission.try_admit_for_run(first).await.unwrap());

    engine.lease.lease("w1").await.unwrap().expect("job leasable");
    // Slot taken: a throttled submission cannot start now.
    let second = engine.admission.submit(request(1, "b")).await.unwrap().job.id;
    assert!(!engine.admission.try_admit_for_run(second).await.unwrap());
}
