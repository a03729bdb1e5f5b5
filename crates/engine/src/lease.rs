//! Lease manager: hands PENDING jobs to workers and accepts their
//! progress, completion, and failure reports.

use std::sync::Arc;

use chrono::Utc;
use rowmill_core::error::EngineResult;
use rowmill_core::types::JobId;
use rowmill_core::EngineConfig;
use rowmill_pipeline::OutputResult;
use rowmill_store::models::{Job, JobStage};
use rowmill_store::{AdmissionPolicy, JobStore, LeaseOutcome};

/// Grants time-bounded, revocable leases and applies lease-holder
/// reports to the store. Possession is verified by identity plus an
/// unexpired `lease_until` on every call.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<JobStore>,
    config: EngineConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy::from(&self.config)
    }

    /// Lease the oldest eligible PENDING job, or `None` when the queue is
    /// idle or admission is saturated.
    pub async fn lease(&self, worker_id: &str) -> EngineResult<Option<Job>> {
        let outcome = self
            .store
            .lease_next(worker_id, &self.policy(), self.config.lease_duration(), Utc::now())
            .await;

        match outcome {
            LeaseOutcome::Leased(job) => {
                tracing::info!(
                    job_id = %job.id,
                    worker_id,
                    lease_until = ?job.lease_until,
                    attempt = job.attempts + 1,
                    "Job leased",
                );
                Ok(Some(*job))
            }
            LeaseOutcome::Saturated => {
                tracing::debug!(worker_id, "Lease refused: admission budgets exhausted");
                Ok(None)
            }
            LeaseOutcome::Idle => Ok(None),
        }
    }

    /// Record a progress report from the lease holder; extends the lease.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        processed_rows: u64,
        stage: JobStage,
    ) -> EngineResult<Job> {
        let job = self
            .store
            .report_progress(
                job_id,
                worker_id,
                processed_rows,
                stage,
                self.config.lease_duration(),
                Utc::now(),
            )
            .await?;
        tracing::debug!(
            job_id = %job.id,
            worker_id,
            progress = job.progress,
            stage = %job.stage,
            "Progress updated",
        );
        Ok(job)
    }

    /// Complete a job on behalf of its lease holder.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        output: OutputResult,
    ) -> EngineResult<Job> {
        let job = self.store.complete(job_id, worker_id, output, Utc::now()).await?;
        tracing::info!(job_id = %job.id, worker_id, "Job completed");
        Ok(job)
    }

    /// Record a failure from the lease holder. Consumes an attempt and
    /// transitions to FAILED (retry scheduled) or DLQ.
    pub async fn fail(&self, job_id: JobId, worker_id: &str, reason: &str) -> EngineResult<Job> {
        let job = self
            .store
            .fail(job_id, worker_id, reason, self.config.retry_delay(), Utc::now())
            .await?;
        tracing::warn!(
            job_id = %job.id,
            worker_id,
            status = %job.status,
            attempts = job.attempts,
            reason,
            "Job failed",
        );
        Ok(job)
    }

    /// Operator-initiated failure of a RUNNING job; same attempt
    /// accounting as a worker failure, no holder check.
    pub async fn force_fail(&self, job_id: JobId, reason: &str) -> EngineResult<Job> {
        let job = self
            .store
            .force_fail(job_id, reason, self.config.retry_delay(), Utc::now())
            .await?;
        tracing::warn!(
            job_id = %job.id,
            status = %job.status,
            attempts = job.attempts,
            reason,
            "Job force-failed by operator",
        );
        Ok(job)
    }
}
