use rowmill_core::EngineConfig;
use rowmill_engine::Engine;
use rowmill_worker::{WorkerConfig, WorkerRunner};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowmill=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    tracing::info!(
        jobs_per_min_limit = engine_config.jobs_per_min_limit,
        concurrent_jobs_limit = engine_config.concurrent_jobs_limit,
        lease_secs = engine_config.lease_secs,
        worker_count = worker_config.worker_count,
        "Loaded configuration",
    );

    let engine = Engine::new(engine_config);
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let reconciler = engine.reconciler.clone();
    let reconciler_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        reconciler.run(reconciler_cancel).await;
    }));

    for i in 0..worker_config.worker_count {
        let runner = WorkerRunner::new(
            format!("worker-{i}"),
            engine.lease.clone(),
            worker_config.poll_interval(),
        );
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            runner.run(worker_cancel).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
