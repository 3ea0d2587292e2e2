//! Worker configuration.

use std::time::Duration;

/// Floor for the lock TTL; long cycle budgets stretch it further.
const LOCK_TTL_FLOOR: Duration = Duration::from_secs(60);

/// Headroom added to the cycle budget when deriving the lock TTL.
const LOCK_TTL_HEADROOM: Duration = Duration::from_secs(30);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue identifier this worker processes
    pub identifier: String,
    /// Wall-clock budget for one worker cycle
    pub time_limit: Duration,
    /// Declared memory limit ("512M", "1G"); None falls back to 512 MiB
    pub memory_limit: Option<String>,
    /// Percent of the memory limit at which a cycle yields
    pub memory_threshold_percent: u8,
    /// Retry handbacks per item before dead-lettering; None removes the cap
    pub max_item_attempts: Option<u32>,
    /// Healthcheck tick interval
    pub healthcheck_interval: Duration,
    /// Keep the healthcheck ticking while the queue is empty
    pub healthcheck_always_on: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identifier: "crmsync".to_string(),
            time_limit: Duration::from_secs(20),
            memory_limit: None,
            memory_threshold_percent: 80,
            max_item_attempts: Some(5),
            healthcheck_interval: Duration::from_secs(300), // 5 minutes
            healthcheck_always_on: false,
        }
    }
}

impl WorkerConfig {
    /// Create a config for the given queue identifier with default budgets.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            identifier: std::env::var("WORKER_IDENTIFIER").unwrap_or_else(|_| "crmsync".to_string()),
            time_limit: Duration::from_secs(
                std::env::var("WORKER_TIME_LIMIT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20),
            ),
            memory_limit: std::env::var("WORKER_MEMORY_LIMIT").ok(),
            memory_threshold_percent: std::env::var("WORKER_MEMORY_THRESHOLD_PERCENT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(80),
            max_item_attempts: match std::env::var("WORKER_MAX_ITEM_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
            {
                // 0 disables the cap
                Some(0) => None,
                Some(n) => Some(n),
                None => Some(5),
            },
            healthcheck_interval: Duration::from_secs(
                std::env::var("WORKER_HEALTHCHECK_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            healthcheck_always_on: std::env::var("WORKER_HEALTHCHECK_ALWAYS_ON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Lock TTL for a worker cycle: at least [`LOCK_TTL_FLOOR`], stretched
    /// past long cycle budgets so the lease outlives the cycle it guards.
    pub fn lock_ttl(&self) -> Duration {
        LOCK_TTL_FLOOR.max(self.time_limit + LOCK_TTL_HEADROOM)
    }

    /// Set the cycle wall-clock budget.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Set or remove the per-item retry cap.
    pub fn with_max_item_attempts(mut self, cap: Option<u32>) -> Self {
        self.max_item_attempts = cap;
        self
    }

    /// Set the declared memory limit string.
    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Set the healthcheck interval.
    pub fn with_healthcheck_interval(mut self, interval: Duration) -> Self {
        self.healthcheck_interval = interval;
        self
    }

    /// Keep the healthcheck ticking even while the queue is empty.
    pub fn with_healthcheck_always_on(mut self, always_on: bool) -> Self {
        self.healthcheck_always_on = always_on;
        self
    }
}
