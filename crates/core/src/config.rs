use std::time::Duration;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development; override via
/// environment variables in production. A limit of `0` disables that check.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max jobs admitted into RUNNING per trailing 60 seconds (`JOBS_PER_MIN_LIMIT`).
    pub jobs_per_min_limit: u32,
    /// Max jobs in RUNNING state at once (`CONCURRENT_JOBS_LIMIT`).
    pub concurrent_jobs_limit: u32,
    /// Lease duration granted to a worker (`JOB_LEASE_SECONDS`).
    pub lease_secs: u64,
    /// Fixed delay before a failed job becomes retry-eligible (`JOB_RETRY_DELAY_SECONDS`).
    pub retry_delay_secs: u64,
    /// Base backoff for throttled jobs (`JOB_THROTTLE_BACKOFF_SECONDS`).
    pub throttle_backoff_secs: u64,
    /// Age after which an unleased PENDING job is flagged as stale
    /// (`JOB_PENDING_TIMEOUT_SECONDS`).
    pub pending_timeout_secs: u64,
    /// Reconciler sweep interval (`JOB_RECONCILE_INTERVAL_SECONDS`).
    pub reconcile_interval_secs: u64,
    /// Attempt ceiling applied when a submission does not override it
    /// (`JOB_MAX_ATTEMPTS`).
    pub default_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs_per_min_limit: 4,
            concurrent_jobs_limit: 2,
            lease_secs: 60,
            retry_delay_secs: 5,
            throttle_backoff_secs: 15,
            pending_timeout_secs: 10,
            reconcile_interval_secs: 5,
            default_max_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `JOBS_PER_MIN_LIMIT`             | `4`     |
    /// | `CONCURRENT_JOBS_LIMIT`          | `2`     |
    /// | `JOB_LEASE_SECONDS`              | `60`    |
    /// | `JOB_RETRY_DELAY_SECONDS`        | `5`     |
    /// | `JOB_THROTTLE_BACKOFF_SECONDS`   | `15`    |
    /// | `JOB_PENDING_TIMEOUT_SECONDS`    | `10`    |
    /// | `JOB_RECONCILE_INTERVAL_SECONDS` | `5`     |
    /// | `JOB_MAX_ATTEMPTS`               | `3`     |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            jobs_per_min_limit: env_or("JOBS_PER_MIN_LIMIT", defaults.jobs_per_min_limit),
            concurrent_jobs_limit: env_or("CONCURRENT_JOBS_LIMIT", defaults.concurrent_jobs_limit),
            lease_secs: env_or("JOB_LEASE_SECONDS", defaults.lease_secs),
            retry_delay_secs: env_or("JOB_RETRY_DELAY_SECONDS", defaults.retry_delay_secs),
            throttle_backoff_secs: env_or(
                "JOB_THROTTLE_BACKOFF_SECONDS",
                defaults.throttle_backoff_secs,
            ),
            pending_timeout_secs: env_or(
                "JOB_PENDING_TIMEOUT_SECONDS",
                defaults.pending_timeout_secs,
            ),
            reconcile_interval_secs: env_or(
                "JOB_RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval_secs,
            ),
            default_max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.default_max_attempts),
        }
    }

    /// Lease duration as a chrono duration.
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }

    /// Retry delay as a chrono duration.
    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_secs as i64)
    }

    /// Stale-PENDING threshold as a chrono duration.
    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_secs as i64)
    }

    /// Reconciler tick as a std duration (for `tokio::time::interval`).
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.jobs_per_min_limit, 4);
        assert_eq!(config.concurrent_jobs_limit, 2);
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.default_max_attempts, 3);
    }

    #[test]
    fn reconcile_interval_is_never_zero() {
        let config = EngineConfig {
            reconcile_interval_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.reconcile_interval(), Duration::from_secs(1));
    }
}
