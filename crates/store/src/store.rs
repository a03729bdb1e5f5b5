//! In-memory job store with atomic, state-keyed transitions.
//!
//! All writers (submitters, workers, the reconciler) go through one
//! `RwLock`, so each compound operation here is a single atomic step:
//! admission counting happens in the same lock as the transition it
//! gates, and lease selection in the same lock as the lock fields it
//! sets. Sweep operations re-check the expected state per job, so a job
//! moved by a worker between a reconciler's read and write is skipped,
//! never double-transitioned.

use std::collections::HashMap;

use chrono::Duration;
use rowmill_core::error::{EngineError, EngineResult};
use rowmill_core::types::{AccountId, JobId, Timestamp};
use rowmill_core::EngineConfig;
use rowmill_pipeline::OutputResult;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Job, JobEvent, JobEventType, JobFilter, JobStage, JobStatus, QueueStats, SubmitRequest,
};

/// Trailing window for the jobs-per-minute admission budget.
const RATE_WINDOW_SECS: i64 = 60;

/// Ceiling on the throttle release backoff.
const MAX_THROTTLE_BACKOFF_SECS: u64 = 300;

/// Default page size for job listing.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Maximum page size for job listing.
const MAX_LIST_LIMIT: usize = 100;

/// Admission budgets evaluated inside store transitions. A limit of 0
/// disables that check.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub jobs_per_min_limit: u32,
    pub concurrent_jobs_limit: u32,
    pub throttle_backoff_secs: u64,
}

impl From<&EngineConfig> for AdmissionPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            jobs_per_min_limit: config.jobs_per_min_limit,
            concurrent_jobs_limit: config.concurrent_jobs_limit,
            throttle_backoff_secs: config.throttle_backoff_secs,
        }
    }
}

/// Result of a submission: the stored (or deduplicated) job.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub job: Job,
    /// False when the submission was refused admission and parked THROTTLED.
    pub admitted: bool,
    /// True when an idempotency key matched an existing job.
    pub deduplicated: bool,
}

/// Result of a lease attempt.
#[derive(Debug)]
pub enum LeaseOutcome {
    Leased(Box<Job>),
    /// An admission budget is exhausted; no lease was granted.
    Saturated,
    /// No eligible PENDING job.
    Idle,
}

/// The single source of truth for jobs and their event logs.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------

    /// Create a new job, or return the existing one when the idempotency
    /// key matches a prior submission by the same account.
    ///
    /// Admission is evaluated in the same lock as the insert: refused
    /// submissions are stored THROTTLED with a `next_run_at` estimate and
    /// never consume an attempt.
    pub async fn submit(
        &self,
        req: SubmitRequest,
        policy: &AdmissionPolicy,
        default_max_attempts: u32,
        now: Timestamp,
    ) -> SubmitOutcome {
        let mut jobs = self.jobs.write().await;

        if let Some(key) = req.idempotency_key.as_deref() {
            let existing = jobs
                .values()
                .find(|j| j.account_id == req.account_id && j.idempotency_key.as_deref() == Some(key));
            if let Some(job) = existing {
                tracing::debug!(job_id = %job.id, idempotency_key = key, "Submission deduplicated");
                return SubmitOutcome {
                    admitted: job.status != JobStatus::Throttled,
                    deduplicated: true,
                    job: job.clone(),
                };
            }
        }

        let refusal = submit_refusal(&jobs, policy, now);
        let total_rows = req.input.rows.len() as u64;

        let mut job = Job {
            id: Uuid::new_v4(),
            account_id: req.account_id,
            label: req.label,
            input: req.input,
            idempotency_key: req.idempotency_key,
            status: JobStatus::Pending,
            stage: JobStage::Validating,
            progress: 0,
            processed_rows: 0,
            total_rows,
            attempts: 0,
            max_attempts: req.max_attempts.unwrap_or(default_max_attempts),
            throttle_count: 0,
            locked_by: None,
            lease_until: None,
            next_retry_at: None,
            next_run_at: None,
            last_ran_at: None,
            failure_reason: None,
            output: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        job.push_event(JobEvent::new(JobEventType::Submitted, now));

        let admitted = match refusal {
            None => true,
            Some((reason, next_run_at)) => {
                job.status = JobStatus::Throttled;
                job.next_run_at = Some(next_run_at);
                job.push_event(JobEvent::new(JobEventType::Throttled, now).with_metadata(json!({
                    "reason": reason,
                    "next_run_at": next_run_at,
                })));
                false
            }
        };

        jobs.insert(job.id, job.clone());
        SubmitOutcome {
            job,
            admitted,
            deduplicated: false,
        }
    }

    // -----------------------------------------------------------------
    // Leasing
    // -----------------------------------------------------------------

    /// Atomically lease the oldest eligible PENDING job for a worker.
    ///
    /// Due THROTTLED jobs are promoted first, so a freed budget is applied
    /// on the very next lease attempt. Selection, admission checks, and
    /// the RUNNING transition happen under one lock, which is what keeps
    /// the concurrency and rate budgets from being overrun by racing
    /// lease calls.
    pub async fn lease_next(
        &self,
        worker_id: &str,
        policy: &AdmissionPolicy,
        lease: Duration,
        now: Timestamp,
    ) -> LeaseOutcome {
        let mut jobs = self.jobs.write().await;

        if lease_saturated(&jobs, policy, now) {
            return LeaseOutcome::Saturated;
        }

        // Capacity check passed: due THROTTLED jobs become eligible on
        // this very attempt.
        release_due_throttles_locked(&mut jobs, now);

        let candidate = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);
        let Some(id) = candidate else {
            return LeaseOutcome::Idle;
        };

        // Selected under the same lock; the entry is still there.
        let Some(job) = jobs.get_mut(&id) else {
            return LeaseOutcome::Idle;
        };
        job.status = JobStatus::Running;
        job.stage = JobStage::Validating;
        job.progress = 0;
        job.processed_rows = 0;
        job.locked_by = Some(worker_id.to_string());
        job.lease_until = Some(now + lease);
        job.last_ran_at = Some(now);
        job.next_run_at = None;
        job.failure_reason = None;
        job.updated_at = now;
        job.push_event(
            JobEvent::new(JobEventType::Leased, now).with_metadata(json!({ "worker": worker_id })),
        );

        LeaseOutcome::Leased(Box::new(job.clone()))
    }

    /// Record a progress report from the current lease holder.
    ///
    /// Progress is clamped monotonic within the attempt, and each accepted
    /// report extends the lease by the full lease duration.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        processed_rows: u64,
        stage: JobStage,
        lease: Duration,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(EngineError::NotFound { id: job_id })?;
        verify_holder(job, worker_id, now)?;

        job.processed_rows = job.processed_rows.max(processed_rows);
        job.progress = job.progress.max(progress_pct(job.processed_rows, job.total_rows));
        job.stage = stage;
        job.lease_until = Some(now + lease);
        job.updated_at = now;
        job.push_event(
            JobEvent::new(JobEventType::ProgressUpdated, now).with_metadata(json!({
                "worker": worker_id,
                "progress": job.progress,
                "processed_rows": job.processed_rows,
            })),
        );

        Ok(job.clone())
    }

    /// Complete a job on behalf of its lease holder.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        output: OutputResult,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(EngineError::NotFound { id: job_id })?;
        verify_holder(job, worker_id, now)?;

        job.status = JobStatus::Done;
        job.stage = JobStage::Done;
        job.progress = 100;
        job.processed_rows = job.total_rows;
        job.output = Some(output);
        job.failure_reason = None;
        job.locked_by = None;
        job.lease_until = None;
        job.next_retry_at = None;
        job.next_run_at = None;
        job.updated_at = now;
        job.push_event(JobEvent::new(JobEventType::Done, now));

        Ok(job.clone())
    }

    /// Record a failure reported by the current lease holder. Consumes an
    /// attempt and transitions to FAILED (retry scheduled) or DLQ.
    pub async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        reason: &str,
        retry_delay: Duration,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(EngineError::NotFound { id: job_id })?;
        verify_holder(job, worker_id, now)?;

        apply_failure(job, reason, retry_delay, now);
        Ok(job.clone())
    }

    /// Operator-initiated failure of a RUNNING job. Bypasses the holder
    /// check but follows the same attempt accounting as a worker failure.
    pub async fn force_fail(
        &self,
        job_id: JobId,
        reason: &str,
        retry_delay: Duration,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(EngineError::NotFound { id: job_id })?;
        if job.status != JobStatus::Running {
            return Err(EngineError::InvalidState {
                job_id,
                expected: JobStatus::Running.as_str(),
                actual: job.status.as_str(),
            });
        }

        apply_failure(job, reason, retry_delay, now);
        Ok(job.clone())
    }

    // -----------------------------------------------------------------
    // Reconciliation sweeps
    // -----------------------------------------------------------------

    /// Fail RUNNING jobs whose lease lapsed without a completion report.
    /// Attempt accounting matches an explicit failure report.
    pub async fn expire_leases(&self, retry_delay: Duration, now: Timestamp) -> Vec<Job> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.lease_until.is_some_and(|until| until < now)
            })
            .map(|j| j.id)
            .collect();

        let mut failed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = jobs.get_mut(&id) {
                // Re-checked here: a job completed between scan and write
                // is skipped.
                if job.status != JobStatus::Running
                    || !job.lease_until.is_some_and(|until| until < now)
                {
                    continue;
                }
                apply_failure(job, "worker lease expired", retry_delay, now);
                failed.push(job.clone());
            }
        }
        failed
    }

    /// Promote FAILED jobs whose retry delay has elapsed back to PENDING.
    pub async fn promote_due_retries(&self, now: Timestamp) -> u64 {
        let mut jobs = self.jobs.write().await;
        let mut promoted = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Failed && job.next_retry_at.is_some_and(|at| at <= now) {
                job.status = JobStatus::Pending;
                job.stage = JobStage::Validating;
                job.next_retry_at = None;
                job.updated_at = now;
                promoted += 1;
            }
        }
        promoted
    }

    /// Promote THROTTLED jobs whose `next_run_at` has elapsed back to
    /// PENDING. Promotion requires the capacity check to pass; when the
    /// budgets are still exhausted the jobs stay THROTTLED and are
    /// reconsidered on the next sweep.
    pub async fn release_due_throttles(&self, policy: &AdmissionPolicy, now: Timestamp) -> u64 {
        let mut jobs = self.jobs.write().await;
        if lease_saturated(&jobs, policy, now) {
            return 0;
        }
        release_due_throttles_locked(&mut jobs, now)
    }

    /// Count (and log) PENDING jobs that have waited past the timeout
    /// without a lease. A capacity problem, not a job problem: they stay
    /// PENDING and visible to operators.
    pub async fn stale_pending(&self, timeout: Duration, now: Timestamp) -> u64 {
        let jobs = self.jobs.read().await;
        let mut stale = 0;
        for job in jobs.values() {
            if job.status == JobStatus::Pending && job.updated_at + timeout < now {
                tracing::warn!(
                    job_id = %job.id,
                    waiting_secs = (now - job.updated_at).num_seconds(),
                    "Pending job has not been leased within the pending timeout",
                );
                stale += 1;
            }
        }
        stale
    }

    // -----------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------

    /// Manual retry of a DONE or FAILED job: fresh attempt cycle.
    pub async fn retry(
        &self,
        account_id: AccountId,
        job_id: JobId,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = scoped_mut(&mut jobs, account_id, job_id)?;
        if !matches!(job.status, JobStatus::Done | JobStatus::Failed) {
            return Err(EngineError::InvalidState {
                job_id,
                expected: "DONE or FAILED",
                actual: job.status.as_str(),
            });
        }

        let from_status = job.status.as_str();
        reset_for_resubmission(job, now);
        job.push_event(JobEvent::new(JobEventType::Submitted, now).with_metadata(json!({
            "retried": true,
            "from_status": from_status,
        })));
        Ok(job.clone())
    }

    /// Replay a dead-lettered job: attempts reset, ceiling unchanged.
    pub async fn replay(
        &self,
        account_id: AccountId,
        job_id: JobId,
        now: Timestamp,
    ) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = scoped_mut(&mut jobs, account_id, job_id)?;
        if job.status != JobStatus::Dlq {
            return Err(EngineError::InvalidState {
                job_id,
                expected: JobStatus::Dlq.as_str(),
                actual: job.status.as_str(),
            });
        }

        reset_for_resubmission(job, now);
        job.push_event(
            JobEvent::new(JobEventType::Submitted, now).with_metadata(json!({ "replayed": true })),
        );
        Ok(job.clone())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// Unscoped fetch for engine-internal checks.
    pub async fn find(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Fetch a job, scoped to its owning account.
    pub async fn get(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id)
            .filter(|j| j.account_id == account_id)
            .cloned()
            .ok_or(EngineError::NotFound { id: job_id })
    }

    /// List an account's jobs, newest first.
    pub async fn list(&self, account_id: AccountId, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<&Job> = jobs
            .values()
            .filter(|j| j.account_id == account_id)
            .filter(|j| filter.status.map_or(true, |status| j.status == status))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0);
        matched.into_iter().skip(offset).take(limit).cloned().collect()
    }

    /// Delete a job and its event log.
    pub async fn delete(&self, account_id: AccountId, job_id: JobId) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let owned = jobs
            .get(&job_id)
            .map(|j| j.account_id == account_id)
            .unwrap_or(false);
        if !owned {
            return Err(EngineError::NotFound { id: job_id });
        }
        jobs.remove(&job_id).ok_or(EngineError::NotFound { id: job_id })
    }

    /// Per-state counts for one account plus global budget utilization.
    pub async fn stats(
        &self,
        account_id: AccountId,
        policy: &AdmissionPolicy,
        now: Timestamp,
    ) -> QueueStats {
        let jobs = self.jobs.read().await;
        let mut stats = QueueStats {
            pending: 0,
            throttled: 0,
            running: 0,
            done: 0,
            failed: 0,
            dlq: 0,
            retry_scheduled: 0,
            jobs_per_min: leased_in_window(&jobs, now) as u64,
            jobs_per_min_limit: policy.jobs_per_min_limit,
            concurrent_jobs: running_count(&jobs) as u64,
            concurrent_jobs_limit: policy.concurrent_jobs_limit,
        };
        for job in jobs.values().filter(|j| j.account_id == account_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Throttled => stats.throttled += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.next_retry_at.is_some() {
                        stats.retry_scheduled += 1;
                    }
                }
                JobStatus::Dlq => stats.dlq += 1,
            }
        }
        stats
    }

    /// Read-only capacity probe: would a lease attempt pass admission now?
    pub async fn capacity_available(&self, policy: &AdmissionPolicy, now: Timestamp) -> bool {
        let jobs = self.jobs.read().await;
        !lease_saturated(&jobs, policy, now)
    }
}

// ---------------------------------------------------------------------
// Locked helpers
// ---------------------------------------------------------------------

fn scoped_mut<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    account_id: AccountId,
    job_id: JobId,
) -> EngineResult<&'a mut Job> {
    jobs.get_mut(&job_id)
        .filter(|j| j.account_id == account_id)
        .ok_or(EngineError::NotFound { id: job_id })
}

/// Lease-holder verification: identity plus an unexpired lease.
///
/// A vanished lease (reconciler already reassigned the job) reports
/// `LeaseExpired`; a lease held by someone else reports `LeaseConflict`.
fn verify_holder(job: &Job, worker_id: &str, now: Timestamp) -> EngineResult<()> {
    match job.locked_by.as_deref() {
        None => Err(EngineError::LeaseExpired { job_id: job.id }),
        Some(holder) if holder != worker_id => Err(EngineError::LeaseConflict {
            job_id: job.id,
            held_by: Some(holder.to_string()),
        }),
        Some(_) => {
            if job.lease_until.is_some_and(|until| until >= now) {
                Ok(())
            } else {
                Err(EngineError::LeaseExpired { job_id: job.id })
            }
        }
    }
}

/// Shared failure bookkeeping for worker reports, operator force-fails,
/// and reconciler-observed lease expiry.
fn apply_failure(job: &mut Job, reason: &str, retry_delay: Duration, now: Timestamp) {
    job.attempts += 1;
    job.failure_reason = Some(reason.to_string());
    job.locked_by = None;
    job.lease_until = None;
    job.stage = JobStage::Validating;
    job.updated_at = now;
    job.push_event(JobEvent::new(JobEventType::Failed, now).with_metadata(json!({
        "reason": reason,
        "attempt": job.attempts,
    })));

    if job.attempts >= job.max_attempts {
        job.status = JobStatus::Dlq;
        job.next_retry_at = None;
        job.push_event(
            JobEvent::new(JobEventType::MovedToDlq, now).with_metadata(json!({ "reason": reason })),
        );
    } else {
        job.status = JobStatus::Failed;
        let next_retry_at = now + retry_delay;
        job.next_retry_at = Some(next_retry_at);
        job.push_event(
            JobEvent::new(JobEventType::RetryScheduled, now)
                .with_metadata(json!({ "next_retry_at": next_retry_at })),
        );
    }
}

/// Reset shared by manual retry and DLQ replay: a fresh attempt cycle.
fn reset_for_resubmission(job: &mut Job, now: Timestamp) {
    job.status = JobStatus::Pending;
    job.stage = JobStage::Validating;
    job.progress = 0;
    job.processed_rows = 0;
    job.attempts = 0;
    job.failure_reason = None;
    job.next_retry_at = None;
    job.next_run_at = None;
    job.locked_by = None;
    job.lease_until = None;
    job.output = None;
    job.updated_at = now;
}

fn release_due_throttles_locked(jobs: &mut HashMap<JobId, Job>, now: Timestamp) -> u64 {
    let mut released = 0;
    for job in jobs.values_mut() {
        let due = job.next_run_at.map_or(true, |at| at <= now);
        if job.status == JobStatus::Throttled && due {
            job.status = JobStatus::Pending;
            job.next_run_at = None;
            job.throttle_count += 1;
            job.updated_at = now;
            released += 1;
        }
    }
    released
}

fn running_count(jobs: &HashMap<JobId, Job>) -> usize {
    jobs.values().filter(|j| j.status == JobStatus::Running).count()
}

/// Jobs admitted into RUNNING within the trailing rate window.
fn leased_in_window(jobs: &HashMap<JobId, Job>, now: Timestamp) -> usize {
    let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
    jobs.values()
        .filter(|j| j.last_ran_at.is_some_and(|at| at >= window_start))
        .count()
}

/// Jobs occupying a slot from a submitter's perspective.
fn in_flight_count(jobs: &HashMap<JobId, Job>) -> usize {
    jobs.values()
        .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
        .count()
}

/// Lease-time admission: RUNNING count and rolling rate window.
fn lease_saturated(jobs: &HashMap<JobId, Job>, policy: &AdmissionPolicy, now: Timestamp) -> bool {
    if policy.concurrent_jobs_limit > 0
        && running_count(jobs) >= policy.concurrent_jobs_limit as usize
    {
        return true;
    }
    policy.jobs_per_min_limit > 0 && leased_in_window(jobs, now) >= policy.jobs_per_min_limit as usize
}

/// Submit-time admission. Returns the refusal reason and the earliest
/// time the job should be reconsidered, or None when admitted.
fn submit_refusal(
    jobs: &HashMap<JobId, Job>,
    policy: &AdmissionPolicy,
    now: Timestamp,
) -> Option<(&'static str, Timestamp)> {
    if policy.jobs_per_min_limit > 0
        && leased_in_window(jobs, now) >= policy.jobs_per_min_limit as usize
    {
        // Budget frees when the oldest in-window admission leaves the window.
        let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
        let oldest = jobs
            .values()
            .filter_map(|j| j.last_ran_at)
            .filter(|at| *at >= window_start)
            .min();
        let next_run_at = oldest
            .map(|at| at + Duration::seconds(RATE_WINDOW_SECS))
            .unwrap_or(now)
            .max(now + Duration::seconds(1));
        return Some(("rate limit reached", next_run_at));
    }

    if policy.concurrent_jobs_limit > 0
        && in_flight_count(jobs) >= policy.concurrent_jobs_limit as usize
    {
        let backoff = throttle_backoff(policy.throttle_backoff_secs);
        return Some(("concurrency limit reached", now + backoff));
    }

    None
}

/// Bounded backoff before a throttled job is reconsidered.
fn throttle_backoff(base_secs: u64) -> Duration {
    Duration::seconds(base_secs.min(MAX_THROTTLE_BACKOFF_SECS) as i64)
}

fn progress_pct(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed * 100) / total).min(100) as u8
}
