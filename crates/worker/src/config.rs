use std::time::Duration;

/// Worker-process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease poll interval in milliseconds (`WORKER_POLL_INTERVAL_MS`).
    pub poll_interval_ms: u64,
    /// Number of worker runners spawned by the binary (`WORKER_COUNT`).
    pub worker_count: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            worker_count: 2,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `WORKER_POLL_INTERVAL_MS`| `1000`  |
    /// | `WORKER_COUNT`           | `2`     |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            worker_count: env_or("WORKER_COUNT", defaults.worker_count).max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
