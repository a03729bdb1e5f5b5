//! Job lifecycle engine: admission control, lease-based work
//! distribution, periodic reconciliation, and the operator service.
//!
//! All components share one [`JobStore`] and compete only through its
//! atomic transitions; none of them caches counts or state of its own.

pub mod admission;
pub mod lease;
pub mod reconciler;
pub mod service;

pub use admission::AdmissionController;
pub use lease::LeaseManager;
pub use reconciler::{Reconciler, SweepReport};
pub use service::JobService;

use std::sync::Arc;

use rowmill_core::EngineConfig;
use rowmill_store::JobStore;

/// Shared handle bundling the engine components over one store.
///
/// Cheap to clone; binaries hand clones to worker tasks and the
/// reconciler loop.
#[derive(Debug, Clone)]
pub struct Engine {
    pub store: Arc<JobStore>,
    pub admission: AdmissionController,
    pub lease: LeaseManager,
    pub reconciler: Reconciler,
    pub service: JobService,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(Arc::new(JobStore::new()), config)
    }

    pub fn with_store(store: Arc<JobStore>, config: EngineConfig) -> Self {
        Self {
            admission: AdmissionController::new(Arc::clone(&store), config.clone()),
            lease: LeaseManager::new(Arc::clone(&store), config.clone()),
            reconciler: Reconciler::new(Arc::clone(&store), config.clone()),
            service: JobService::new(Arc::clone(&store), config),
            store,
        }
    }
}
