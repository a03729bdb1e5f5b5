//! End-to-end: submit → lease → pipeline → report, through the real
//! worker runner against a live engine.

use std::time::Duration;

use chrono::Utc;
use rowmill_core::EngineConfig;
use rowmill_engine::Engine;
use rowmill_pipeline::ProcessingConfig;
use rowmill_store::models::{JobEventType, JobInput, JobStatus, SubmitRequest};
use rowmill_worker::WorkerRunner;
use serde_json::json;

fn engine() -> Engine {
    Engine::new(EngineConfig {
        jobs_per_min_limit: 0,
        concurrent_jobs_limit: 0,
        retry_delay_secs: 0,
        ..EngineConfig::default()
    })
}

fn runner(engine: &Engine) -> WorkerRunner {
    WorkerRunner::new("w1", engine.lease.clone(), Duration::from_millis(10))
}

#[tokio::test]
async fn processes_a_batch_to_done_with_counts() {
    let engine = engine();
    let req = SubmitRequest {
        account_id: 1,
        label: "customer import".into(),
        input: JobInput {
            rows: vec![
                json!({"id": 1, "email": "a@x.com", "amount": 10}),
                json!({"id": 1, "email": "a@x.com", "amount": 10}),
                json!({"id": 2, "email": ""}),
                json!({"id": 3, "email": "c@x.com", "amount": "5"}),
            ],
            config: ProcessingConfig {
                required_fields: vec!["email".into()],
                dedupe_on: vec!["id".into()],
                drop_nulls: true,
                numeric_field: Some("amount".into()),
                strict_mode: false,
            },
            ..JobInput::default()
        },
        idempotency_key: None,
        max_attempts: None,
    };
    let job_id = engine.admission.submit(req).await.unwrap().job.id;

    assert!(runner(&engine).run_once().await.unwrap());

    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.progress, 100);
    assert!(job.locked_by.is_none());

    let output = job.output.expect("output stored");
    assert_eq!(output.total_processed, 4);
    assert_eq!(output.total_valid, 2);
    assert_eq!(output.duplicates_removed, 1);
    assert_eq!(output.nulls_dropped, 1);
    assert_eq!(output.total_invalid, 0);
    let stats = output.numeric_stats.expect("numeric stats");
    assert_eq!(stats.sum, 15.0);
    assert_eq!(stats.min, 5.0);
    assert_eq!(stats.max, 10.0);

    let types: Vec<JobEventType> = job.events.iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&JobEventType::Submitted));
    assert!(types.contains(&JobEventType::Leased));
    assert!(types.contains(&JobEventType::ProgressUpdated));
    assert_eq!(types.last(), Some(&JobEventType::Done));
}

#[tokio::test]
async fn strict_mode_failures_consume_attempts_until_dlq() {
    let engine = engine();
    let req = SubmitRequest {
        account_id: 1,
        label: "strict import".into(),
        input: JobInput {
            rows: vec![json!({"name": "missing email"})],
            config: ProcessingConfig {
                required_fields: vec!["email".into()],
                strict_mode: true,
                ..ProcessingConfig::default()
            },
            ..JobInput::default()
        },
        idempotency_key: None,
        max_attempts: Some(2),
    };
    let job_id = engine.admission.submit(req).await.unwrap().job.id;

    // First attempt fails; zero retry delay means one sweep requeues it.
    assert!(runner(&engine).run_once().await.unwrap());
    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.failure_reason.as_deref().unwrap().contains("rejected"));

    let report = engine.reconciler.sweep_once(Utc::now()).await;
    assert_eq!(report.promoted_retries, 1);

    // Second attempt exhausts the budget.
    assert!(runner(&engine).run_once().await.unwrap());
    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dlq);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn idle_queue_yields_no_work() {
    let engine = engine();
    assert!(!runner(&engine).run_once().await.unwrap());
}

#[tokio::test]
async fn replayed_dlq_job_runs_again() {
    let engine = engine();
    let req = SubmitRequest {
        account_id: 1,
        label: "second chance".into(),
        input: JobInput {
            rows: vec![json!({"id": 1})],
            config: ProcessingConfig {
                required_fields: vec!["email".into()],
                strict_mode: true,
                ..ProcessingConfig::default()
            },
            ..JobInput::default()
        },
        idempotency_key: None,
        max_attempts: Some(1),
    };
    let job_id = engine.admission.submit(req).await.unwrap().job.id;

    assert!(runner(&engine).run_once().await.unwrap());
    assert_eq!(
        engine.service.get(1, job_id).await.unwrap().status,
        JobStatus::Dlq
    );

    engine.service.replay(1, job_id).await.unwrap();
    // Still the same bad input: it fails again rather than completing.
    assert!(runner(&engine).run_once().await.unwrap());
    let job = engine.service.get(1, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dlq);
    assert_eq!(job.attempts, 1);
}
