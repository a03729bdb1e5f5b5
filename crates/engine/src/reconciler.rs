//! Periodic reconciliation sweep.
//!
//! A single long-lived loop, structurally separate from worker traffic,
//! that repairs time-based state: expired leases, due retries, due
//! throttle releases, and stale PENDING detection. Every transition goes
//! through the same store primitives as the request-driven paths, keyed
//! on the expected current state, so the sweep is idempotent and safe to
//! run concurrently with live lease and report traffic.

use std::sync::Arc;

use chrono::Utc;
use rowmill_core::types::Timestamp;
use rowmill_core::EngineConfig;
use rowmill_store::{AdmissionPolicy, JobStore};
use tokio_util::sync::CancellationToken;

/// Counters from one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    /// RUNNING jobs failed because their lease lapsed.
    pub expired_leases: u64,
    /// FAILED jobs promoted back to PENDING after their retry delay.
    pub promoted_retries: u64,
    /// THROTTLED jobs released to PENDING.
    pub released_throttles: u64,
    /// PENDING jobs waiting past the pending timeout (flagged only).
    pub stale_pending: u64,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.expired_leases == 0
            && self.promoted_retries == 0
            && self.released_throttles == 0
            && self.stale_pending == 0
    }
}

/// The retry/DLQ reconciler loop.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Arc<JobStore>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(store: Arc<JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval());
        tracing::info!(
            interval_secs = self.config.reconcile_interval_secs,
            "Reconciler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_once(Utc::now()).await;
                    if !report.is_quiet() {
                        tracing::info!(
                            expired_leases = report.expired_leases,
                            promoted_retries = report.promoted_retries,
                            released_throttles = report.released_throttles,
                            stale_pending = report.stale_pending,
                            "Reconciliation sweep applied transitions",
                        );
                    }
                }
            }
        }
    }

    /// One reconciliation pass at the given instant.
    pub async fn sweep_once(&self, now: Timestamp) -> SweepReport {
        let policy = AdmissionPolicy::from(&self.config);

        let expired = self
            .store
            .expire_leases(self.config.retry_delay(), now)
            .await;
        for job in &expired {
            tracing::warn!(
                job_id = %job.id,
                status = %job.status,
                attempts = job.attempts,
                "Lease expired without completion; job failed by reconciler",
            );
        }

        let promoted_retries = self.store.promote_due_retries(now).await;
        let released_throttles = self.store.release_due_throttles(&policy, now).await;
        let stale_pending = self
            .store
            .stale_pending(self.config.pending_timeout(), now)
            .await;

        SweepReport {
            expired_leases: expired.len() as u64,
            promoted_retries,
            released_throttles,
            stale_pending,
        }
    }
}
