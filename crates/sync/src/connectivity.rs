//! Connectivity oracle: "can we reach the server, and is there internet at
//! all", answered with a short-lived cache.
//!
//! Reaching our own health endpoint implies internet. When that probe fails,
//! a well-known external endpoint disambiguates "our server is down" from
//! "no connectivity at all". Probe failures are states, never errors.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConnectivityConfig;

/// Result of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityStatus {
    /// Derived from server reachability: the engine is "online" only when
    /// its own backend answers.
    pub is_online: bool,
    pub last_check: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub server_reachable: bool,
    pub internet_reachable: bool,
}

impl fieldops_core::ValueObject for ConnectivityStatus {}

/// Low-level reachability probe.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Probe a URL. Any failure, including a timeout, means unreachable.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// Production probe issuing real HTTP GETs.
#[derive(Debug, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(url, error = %err, "connectivity probe failed");
                false
            }
        }
    }
}

/// TTL-cached online/offline oracle.
pub struct ConnectivityOracle {
    config: ConnectivityConfig,
    probe: Arc<dyn ConnectivityProbe>,
    cached: Mutex<Option<ConnectivityStatus>>,
}

impl ConnectivityOracle {
    pub fn new(config: ConnectivityConfig, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            config,
            probe,
            cached: Mutex::new(None),
        }
    }

    /// Current connectivity. A non-forced check inside the TTL window returns
    /// the cached status without any network I/O.
    pub async fn check(&self, force: bool) -> ConnectivityStatus {
        if !force {
            if let Some(status) = self.fresh_cached() {
                return status;
            }
        }

        let started = Instant::now();
        let server_reachable = self
            .probe
            .probe(&self.config.health_url, self.config.probe_timeout)
            .await;

        let status = if server_reachable {
            ConnectivityStatus {
                is_online: true,
                last_check: Utc::now(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                server_reachable: true,
                internet_reachable: true,
            }
        } else {
            let internet_reachable = self
                .probe
                .probe(&self.config.fallback_url, self.config.probe_timeout)
                .await;
            ConnectivityStatus {
                is_online: false,
                last_check: Utc::now(),
                latency_ms: None,
                server_reachable: false,
                internet_reachable,
            }
        };

        tracing::debug!(
            online = status.is_online,
            server = status.server_reachable,
            internet = status.internet_reachable,
            "connectivity checked"
        );

        *self.cached.lock().unwrap() = Some(status.clone());
        status
    }

    /// Non-blocking answer: the cached value (false before the first check
    /// completes), with a refresh kicked off in the background.
    pub fn quick_is_online(self: &Arc<Self>) -> bool {
        let cached = self
            .cached
            .lock()
            .unwrap()
            .as_ref()
            .map(|status| status.is_online)
            .unwrap_or(false);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.check(true).await;
        });

        cached
    }

    /// Last known status, if any check has completed.
    pub fn last_status(&self) -> Option<ConnectivityStatus> {
        self.cached.lock().unwrap().clone()
    }

    fn fresh_cached(&self) -> Option<ConnectivityStatus> {
        let cached = self.cached.lock().unwrap();
        let status = cached.as_ref()?;
        let ttl = chrono::Duration::from_std(self.config.cache_ttl).ok()?;
        if Utc::now().signed_duration_since(status.last_check) < ttl {
            Some(status.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe returning scripted answers per URL, counting calls.
    struct ScriptedProbe {
        server_up: bool,
        internet_up: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(server_up: bool, internet_up: bool) -> Arc<Self> {
            Arc::new(Self {
                server_up,
                internet_up,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn probe(&self, url: &str, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("health") {
                self.server_up
            } else {
                self.internet_up
            }
        }
    }

    fn config() -> ConnectivityConfig {
        ConnectivityConfig::new("http://api.local/health")
            .with_fallback_url("http://fallback.local/probe")
    }

    #[tokio::test]
    async fn server_reachable_implies_internet() {
        let probe = ScriptedProbe::new(true, false);
        let oracle = ConnectivityOracle::new(config(), probe.clone());

        let status = oracle.check(true).await;
        assert!(status.is_online);
        assert!(status.server_reachable);
        assert!(status.internet_reachable);
        assert!(status.latency_ms.is_some());
        // No fallback probe when the health endpoint answers.
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test]
    async fn distinguishes_server_down_from_no_internet() {
        let probe = ScriptedProbe::new(false, true);
        let oracle = ConnectivityOracle::new(config(), probe.clone());

        let status = oracle.check(true).await;
        assert!(!status.is_online);
        assert!(!status.server_reachable);
        assert!(status.internet_reachable);
        assert!(status.latency_ms.is_none());
        assert_eq!(probe.call_count(), 2);

        let probe = ScriptedProbe::new(false, false);
        let oracle = ConnectivityOracle::new(config(), probe.clone());
        let status = oracle.check(true).await;
        assert!(!status.internet_reachable);
    }

    #[tokio::test]
    async fn checks_within_ttl_hit_the_cache() {
        let probe = ScriptedProbe::new(true, true);
        let oracle = ConnectivityOracle::new(config(), probe.clone());

        let first = oracle.check(false).await;
        let second = oracle.check(false).await;
        assert_eq!(first, second);
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test]
    async fn forced_check_ignores_the_cache() {
        let probe = ScriptedProbe::new(true, true);
        let oracle = ConnectivityOracle::new(config(), probe.clone());

        oracle.check(false).await;
        oracle.check(true).await;
        assert_eq!(probe.call_count(), 2);
    }

    #[tokio::test]
    async fn expired_cache_triggers_a_new_probe() {
        let probe = ScriptedProbe::new(true, true);
        let oracle = ConnectivityOracle::new(
            config().with_cache_ttl(Duration::ZERO),
            probe.clone(),
        );

        oracle.check(false).await;
        oracle.check(false).await;
        assert_eq!(probe.call_count(), 2);
    }

    #[tokio::test]
    async fn http_probe_reports_unreachable_endpoints_as_false() {
        let probe = HttpProbe::new();
        // Nothing listens on the discard port; the connection is refused.
        assert!(
            !probe
                .probe("http://127.0.0.1:9/health", Duration::from_millis(250))
                .await
        );
    }

    #[tokio::test]
    async fn quick_is_online_defaults_to_false_and_refreshes() {
        let probe = ScriptedProbe::new(true, true);
        let oracle = Arc::new(ConnectivityOracle::new(config(), probe.clone()));

        assert!(!oracle.quick_is_online());

        // Let the background refresh land, then the cache answers true.
        tokio::task::yield_now().await;
        oracle.check(false).await;
        assert!(oracle.quick_is_online());
    }
}
