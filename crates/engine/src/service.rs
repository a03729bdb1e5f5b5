//! Operator/UI-facing job service: listing, inspection, manual retry,
//! DLQ replay, force-fail, deletion, and queue stats. All reads and
//! mutations are scoped to the owning account.

use std::sync::Arc;

use chrono::Utc;
use rowmill_core::error::EngineResult;
use rowmill_core::types::{AccountId, JobId};
use rowmill_core::EngineConfig;
use rowmill_store::models::{Job, JobFilter, QueueStats};
use rowmill_store::{AdmissionPolicy, JobStore};

#[derive(Debug, Clone)]
pub struct JobService {
    store: Arc<JobStore>,
    config: EngineConfig,
}

impl JobService {
    pub fn new(store: Arc<JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// List the account's jobs, newest first.
    pub async fn list(&self, account_id: AccountId, filter: &JobFilter) -> Vec<Job> {
        self.store.list(account_id, filter).await
    }

    pub async fn get(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        self.store.get(account_id, job_id).await
    }

    /// Delete a job and its event log.
    pub async fn delete(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        let job = self.store.delete(account_id, job_id).await?;
        tracing::info!(job_id = %job.id, account_id, "Job deleted");
        Ok(job)
    }

    /// Manual retry of a DONE or FAILED job: fresh attempt cycle.
    pub async fn retry(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        let job = self.store.retry(account_id, job_id, Utc::now()).await?;
        tracing::info!(job_id = %job.id, account_id, "Job manually retried");
        Ok(job)
    }

    /// Replay a dead-lettered job: attempts reset to 0, ceiling unchanged.
    pub async fn replay(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        let job = self.store.replay(account_id, job_id, Utc::now()).await?;
        tracing::info!(job_id = %job.id, account_id, "DLQ job replayed");
        Ok(job)
    }

    /// Operator-initiated failure of a RUNNING job.
    pub async fn force_fail(
        &self,
        account_id: AccountId,
        job_id: JobId,
        reason: &str,
    ) -> EngineResult<Job> {
        // Ownership check first; the transition itself is unscoped.
        self.store.get(account_id, job_id).await?;
        self.store
            .force_fail(job_id, reason, self.config.retry_delay(), Utc::now())
            .await
    }

    /// Per-state counts plus current rate/concurrency utilization.
    pub async fn stats(&self, account_id: AccountId) -> QueueStats {
        self.store
            .stats(account_id, &AdmissionPolicy::from(&self.config), Utc::now())
            .await
    }
}
