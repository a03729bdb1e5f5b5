//! Job Store: the single source of truth for jobs and their event logs.
//!
//! Every mutation is an atomic check-then-write transition serialized
//! through one store lock, which is what upholds the lease-exclusivity
//! and admission invariants under concurrent submitters, workers, and
//! the reconciler.

pub mod models;
mod store;

pub use store::{AdmissionPolicy, JobStore, LeaseOutcome, SubmitOutcome};
