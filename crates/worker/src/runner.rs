//! The worker poll-execute loop.
//!
//! One runner repeatedly asks the lease manager for work, runs the
//! pipeline on a blocking thread, and forwards batched progress through
//! a channel to the async reporter. There is no cancellation signal to a
//! running job: a lost lease surfaces as a rejected report, at which
//! point the runner abandons the attempt (the reconciler has already
//! reassigned the job).

use std::time::Duration;

use rowmill_core::error::{EngineError, EngineResult};
use rowmill_core::types::JobId;
use rowmill_engine::LeaseManager;
use rowmill_pipeline::process;
use rowmill_store::models::{Job, JobStage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct WorkerRunner {
    id: String,
    lease: LeaseManager,
    poll_interval: Duration,
}

impl WorkerRunner {
    pub fn new(id: impl Into<String>, lease: LeaseManager, poll_interval: Duration) -> Self {
        Self {
            id: id.into(),
            lease,
            poll_interval,
        }
    }

    /// Run the poll loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(worker_id = %self.id, "Worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(worker_id = %self.id, "Worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(worker_id = %self.id, error = %e, "Worker iteration failed");
                    }
                }
            }
        }
    }

    /// One poll-execute iteration. Returns whether a job was processed.
    pub async fn run_once(&self) -> EngineResult<bool> {
        let Some(job) = self.lease.lease(&self.id).await? else {
            return Ok(false);
        };
        self.execute(job).await;
        Ok(true)
    }

    async fn execute(&self, job: Job) {
        let job_id = job.id;
        if !self.report(job_id, 0, JobStage::Validating).await {
            return;
        }

        let rows = job.input.rows;
        let config = job.input.config;

        // The pipeline is CPU-bound and synchronous; progress flows back
        // through a channel so reports stay on the async side.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = tokio::task::spawn_blocking(move || {
            process(&rows, &config, |processed| {
                let _ = tx.send(processed);
            })
        });

        let mut lease_lost = false;
        while let Some(processed) = rx.recv().await {
            if !lease_lost && !self.report(job_id, processed, JobStage::Processing).await {
                // The attempt is dead, but keep draining so the loop
                // still observes the pipeline finishing.
                lease_lost = true;
            }
        }

        let result = match pipeline.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job_id, worker_id = %self.id, error = %e, "Pipeline task aborted");
                if !lease_lost {
                    self.try_fail(job_id, "pipeline task aborted").await;
                }
                return;
            }
        };

        if lease_lost {
            tracing::warn!(job_id = %job_id, worker_id = %self.id, "Lease lost mid-run; attempt abandoned");
            return;
        }

        match result {
            Ok(output) => {
                if !self.report(job_id, output.total_processed, JobStage::Finalizing).await {
                    return;
                }
                if let Err(e) = self.lease.complete(job_id, &self.id, output).await {
                    tracing::warn!(job_id = %job_id, worker_id = %self.id, error = %e, "Completion rejected");
                }
            }
            Err(e) => self.try_fail(job_id, &e.to_string()).await,
        }
    }

    /// Report progress. Returns false when the lease is no longer ours.
    async fn report(&self, job_id: JobId, processed: u64, stage: JobStage) -> bool {
        match self.lease.report_progress(job_id, &self.id, processed, stage).await {
            Ok(_) => true,
            Err(EngineError::LeaseExpired { .. } | EngineError::LeaseConflict { .. }) => {
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = %self.id,
                    "Lease no longer held; work was reassigned",
                );
                false
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, worker_id = %self.id, error = %e, "Progress report failed");
                false
            }
        }
    }

    async fn try_fail(&self, job_id: JobId, reason: &str) {
        if let Err(e) = self.lease.fail(job_id, &self.id, reason).await {
            tracing::warn!(job_id = %job_id, worker_id = %self.id, error = %e, "Failure report rejected");
        }
    }
}
