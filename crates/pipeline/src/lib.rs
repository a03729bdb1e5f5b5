//! Row validation, deduplication, and aggregation pipeline.
//!
//! [`process`] is a pure function invoked once per lease attempt: a retried
//! job re-runs from row 0 (no checkpointing). Input framing (HTTP multipart,
//! CSV parsing, file storage) is handled by external collaborators; this
//! crate only sees an in-memory row sequence plus a [`ProcessingConfig`].

mod config;
mod process;

pub use config::ProcessingConfig;
pub use process::{process, NumericStats, OutputResult, PipelineError, PROGRESS_EVERY_ROWS};
