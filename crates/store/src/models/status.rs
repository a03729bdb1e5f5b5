//! Lifecycle state, stage, and derived-status enums.

use serde::{Deserialize, Serialize};

/// Stored job lifecycle state.
///
/// `Done` and `Dlq` are terminal; a manual retry or replay starts a fresh
/// attempt cycle rather than transitioning out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Throttled,
    Running,
    Done,
    Failed,
    Dlq,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Throttled => "THROTTLED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Dlq => "DLQ",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dlq)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing stage within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Validating,
    Processing,
    Finalizing,
    Done,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Validating => "VALIDATING",
            JobStage::Processing => "PROCESSING",
            JobStage::Finalizing => "FINALIZING",
            JobStage::Done => "DONE",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation view of the lifecycle state.
///
/// `Retrying` is derived (`FAILED` with a scheduled retry), never stored:
/// keeping it out of [`JobStatus`] avoids a parallel enum that can drift
/// from the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DerivedStatus {
    Pending,
    Throttled,
    Running,
    Retrying,
    Done,
    Failed,
    Dlq,
}
