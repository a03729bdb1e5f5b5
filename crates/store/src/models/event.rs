//! Append-only job event log entries.

use rowmill_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Event types recorded in a job's audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Submitted,
    Leased,
    ProgressUpdated,
    RetryScheduled,
    Throttled,
    Failed,
    MovedToDlq,
    Done,
}

/// One immutable entry in a job's event log, ordered by occurrence.
///
/// Events are never mutated or deleted except by deleting the whole job;
/// the UI reconstructs its timeline from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_type: JobEventType,
    pub timestamp: Timestamp,
    /// Structured context: worker id, progress value, failure reason,
    /// next-retry time, and similar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl JobEvent {
    pub fn new(event_type: JobEventType, timestamp: Timestamp) -> Self {
        Self {
            event_type,
            timestamp,
            metadata: None,
        }
    }

    /// Attach structured metadata to the event.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
