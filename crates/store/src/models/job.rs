//! Job entity and DTOs.

use rowmill_core::types::{AccountId, JobId, Timestamp, WorkerId};
use rowmill_pipeline::{OutputResult, ProcessingConfig};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::event::JobEvent;
use super::status::{DerivedStatus, JobStage, JobStatus};

/// How a job's rows reached the system. File uploads are parsed by an
/// upstream collaborator; either way the engine sees an in-memory row
/// array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputMode {
    #[default]
    Inline,
    File,
}

/// Input snapshot a job carries: the row sequence plus its processing
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub mode: InputMode,
    /// Name of the uploaded file, when `mode` is [`InputMode::File`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub rows: Vec<serde_json::Value>,
    pub config: ProcessingConfig,
}

/// The central entity: one submitted batch and its full lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub account_id: AccountId,
    pub label: String,
    pub input: JobInput,
    pub idempotency_key: Option<String>,

    pub status: JobStatus,
    pub stage: JobStage,
    /// 0–100, monotonic non-decreasing within one attempt.
    pub progress: u8,
    pub processed_rows: u64,
    pub total_rows: u64,

    /// Count of attempt-consuming failures. Throttling never touches it.
    pub attempts: u32,
    pub max_attempts: u32,
    pub throttle_count: u32,

    pub locked_by: Option<WorkerId>,
    pub lease_until: Option<Timestamp>,
    pub next_retry_at: Option<Timestamp>,
    pub next_run_at: Option<Timestamp>,
    /// Set each time a lease is granted; feeds the rolling rate window.
    pub last_ran_at: Option<Timestamp>,

    pub failure_reason: Option<String>,
    pub output: Option<OutputResult>,

    /// Append-only audit log, ordered by occurrence.
    pub events: Vec<JobEvent>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Append an event to the audit log.
    pub fn push_event(&mut self, event: JobEvent) {
        self.events.push(event);
    }

    /// Presentation status, surfacing the derived `RETRYING` view for
    /// failed jobs that are waiting out their retry delay.
    pub fn derived_status(&self) -> DerivedStatus {
        match self.status {
            JobStatus::Pending => DerivedStatus::Pending,
            JobStatus::Throttled => DerivedStatus::Throttled,
            JobStatus::Running => DerivedStatus::Running,
            JobStatus::Done => DerivedStatus::Done,
            JobStatus::Failed if self.next_retry_at.is_some() => DerivedStatus::Retrying,
            JobStatus::Failed => DerivedStatus::Failed,
            JobStatus::Dlq => DerivedStatus::Dlq,
        }
    }

    /// True while a worker holds an unexpired lease.
    pub fn has_active_lease(&self, now: Timestamp) -> bool {
        self.locked_by.is_some() && self.lease_until.is_some_and(|until| until > now)
    }
}

/// A new-job submission, as handed over by the transport layer.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitRequest {
    pub account_id: AccountId,
    #[validate(length(min = 1, max = 255, message = "label must be 1-255 characters"))]
    pub label: String,
    #[serde(default)]
    pub input: JobInput,
    /// Client token deduplicating logically-identical submissions.
    pub idempotency_key: Option<String>,
    /// Override of the attempt ceiling; engine default applies when unset.
    #[validate(range(min = 1, message = "max_attempts must be at least 1"))]
    pub max_attempts: Option<u32>,
}

/// Listing filter for the operator interface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<usize>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<usize>,
}

/// Aggregate queue health for one account, plus global budget utilization.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub throttled: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub dlq: u64,
    /// Failed jobs currently waiting out their retry delay (derived view).
    pub retry_scheduled: u64,
    pub jobs_per_min: u64,
    pub jobs_per_min_limit: u32,
    pub concurrent_jobs: u64,
    pub concurrent_jobs_limit: u32,
}
