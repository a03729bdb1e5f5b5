use crate::types::JobId;

/// Domain errors surfaced by the job engine.
///
/// Admission refusals (rate or concurrency budget exhausted) are NOT
/// errors: they surface as the `Throttled` job status or an empty lease
/// response, and never consume a retry attempt.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No job with this id is visible to the caller.
    #[error("Job not found: {id}")]
    NotFound { id: JobId },

    /// A worker call arrived for a lease held by someone else.
    /// Logged and rejected; no state change.
    #[error("Lease conflict on job {job_id}: lease is held by {held_by:?}")]
    LeaseConflict { job_id: JobId, held_by: Option<String> },

    /// The caller held the lease once, but it lapsed and the job was
    /// (or will be) reassigned. Distinct from [`EngineError::LeaseConflict`]
    /// so workers know their attempt is dead.
    #[error("Lease expired for job {job_id}")]
    LeaseExpired { job_id: JobId },

    /// An operation that is only legal in a specific lifecycle state was
    /// attempted in another (e.g. replaying a job that is not in DLQ).
    #[error("Job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        expected: &'static str,
        actual: &'static str,
    },

    /// A malformed submission (empty label, zero max-attempts, ...).
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
