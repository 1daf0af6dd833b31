//! Policy constants for retries, scheduling, and connectivity checks.
//!
//! Retry ceilings, backoff bounds, tick cadence, and cache TTLs are policy
//! choices, not structural requirements. They live here as plain config
//! structs with defaults instead of hard-coded values.

use std::time::Duration;

/// Retry/backoff and scheduling policy for the queue and processor.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry ceiling per item; reaching it moves the item to `Failed`.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries of one item.
    pub retry_base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub retry_max_delay: Duration,
    /// Cadence of the periodic drain tick.
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            tick_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Connectivity oracle policy: probe targets, timeout, and cache TTL.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Health endpoint of our own service.
    pub health_url: String,
    /// Well-known external endpoint used to tell "server down" from
    /// "no internet at all".
    pub fallback_url: String,
    /// Per-probe timeout; a timed-out probe counts as unreachable.
    pub probe_timeout: Duration,
    /// How long a check result stays fresh before a re-probe is allowed.
    pub cache_ttl: Duration,
}

impl ConnectivityConfig {
    pub fn new(health_url: impl Into<String>) -> Self {
        Self {
            health_url: health_url.into(),
            fallback_url: "https://dns.google".to_string(),
            probe_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(10),
        }
    }

    pub fn with_fallback_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = url.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Offline snapshot apply policy.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Attempts for the atomic apply step before giving up.
    pub max_attempts: u32,
    /// Base delay between apply attempts (doubles per attempt).
    pub retry_base_delay: Duration,
    /// Highest snapshot schema version this service accepts.
    pub max_schema_version: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            max_schema_version: crate::snapshot::SCHEMA_VERSION,
        }
    }
}

impl SnapshotConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}
