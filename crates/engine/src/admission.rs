//! Admission control: submission gatekeeping and the shared capacity
//! check used by the lease path.

use std::sync::Arc;

use chrono::Utc;
use rowmill_core::error::{EngineError, EngineResult};
use rowmill_core::types::JobId;
use rowmill_core::EngineConfig;
use rowmill_store::models::{JobStatus, SubmitRequest};
use rowmill_store::{AdmissionPolicy, JobStore, SubmitOutcome};
use validator::Validate;

/// Gatekeeps new submissions and lease admissions against the rate and
/// concurrency budgets, and deduplicates submissions by idempotency key.
///
/// Both checks are evaluated inside the store transaction that performs
/// the gated transition, never against a separately cached counter.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    store: Arc<JobStore>,
    config: EngineConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy::from(&self.config)
    }

    /// Validate and admit a submission.
    ///
    /// Refused submissions are stored THROTTLED with a `next_run_at`
    /// estimate rather than rejected outright; throttling never consumes
    /// an attempt.
    pub async fn submit(&self, req: SubmitRequest) -> EngineResult<SubmitOutcome> {
        req.validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let outcome = self
            .store
            .submit(req, &self.policy(), self.config.default_max_attempts, Utc::now())
            .await;

        if outcome.deduplicated {
            tracing::info!(
                job_id = %outcome.job.id,
                "Submission deduplicated by idempotency key",
            );
        } else if outcome.admitted {
            tracing::info!(
                job_id = %outcome.job.id,
                account_id = outcome.job.account_id,
                total_rows = outcome.job.total_rows,
                "Job submitted",
            );
        } else {
            tracing::info!(
                job_id = %outcome.job.id,
                account_id = outcome.job.account_id,
                next_run_at = ?outcome.job.next_run_at,
                "Job throttled at submission",
            );
        }

        Ok(outcome)
    }

    /// Would this job pass admission for a run right now?
    ///
    /// Advisory probe: the authoritative check runs inside the lease
    /// transition itself, so a `true` here can still lose the race.
    pub async fn try_admit_for_run(&self, job_id: JobId) -> EngineResult<bool> {
        let now = Utc::now();
        let job = self
            .store
            .find(job_id)
            .await
            .ok_or(EngineError::NotFound { id: job_id })?;

        let runnable = match job.status {
            JobStatus::Pending => true,
            JobStatus::Throttled => job.next_run_at.map_or(true, |at| at <= now),
            _ => false,
        };
        if !runnable {
            return Ok(false);
        }

        Ok(self.store.capacity_available(&self.policy(), now).await)
    }
}
