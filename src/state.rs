//! Shared application state for Axum handlers.
//!
//! Holds the configuration, the [`RateLimiter`] every protected route shares,
//! the API key layer, and the trusted proxy ranges used by both the auth and
//! rate limit layers.
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, StoreBackend};
use crate::metrics::set_store_up;
use crate::middleware::{ApiKeyAuth, TrustedProxyConfig};
use crate::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore, StoreError};

/// How often expired auth failure state is swept.
const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state for Axum handlers.
///
/// Cloned for each request; all internal data is behind `Arc`.
///
/// ```rust,ignore
/// let store = connect_store(&config).await?;
/// let state = AppState::new(config, store);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Limiter over the shared counter store
    pub limiter: Arc<RateLimiter>,
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    /// API key identity layer, shared so its failure state can be swept
    pub auth: ApiKeyAuth,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Result of the most recent store probe
    store_healthy: Arc<AtomicBool>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state over a connected store and start the store health probe.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: Config, store: Arc<dyn CounterStore>) -> Self {
        let limiter = RateLimiter::new(store).with_key_prefix(config.key_prefix.as_str());
        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));
        let auth = ApiKeyAuth::new(config.api_keys.clone(), trusted_proxies.clone());

        let state = Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            trusted_proxies,
            auth,
            started_at: Instant::now(),
            store_healthy: Arc::new(AtomicBool::new(true)),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };
        set_store_up(true);

        state.spawn_health_check_task();
        state.spawn_auth_sweep_task();
        state
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        self.limiter.store()
    }

    /// Health as of the last background probe.
    pub fn store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::Relaxed)
    }

    /// Ping the store now and record the result.
    pub async fn check_store(&self) -> Result<(), StoreError> {
        let result = self.store().ping().await;
        record_probe(&self.store_healthy, &result);
        result
    }

    /// Periodically ping the store so `/ready` and the `store_up` gauge
    /// notice an outage before requests start failing.
    fn spawn_health_check_task(&self) {
        let store = self.store().clone();
        let healthy = self.store_healthy.clone();
        let interval_duration = self.config.health_check_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(interval_duration);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Health check task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = store.ping().await;
                        record_probe(&healthy, &result);
                    }
                }
            }

            debug!("Health check task shutting down");
        });
    }

    /// Periodically drop expired auth blocks so per-IP failure state stays
    /// bounded by recent traffic.
    fn spawn_auth_sweep_task(&self) {
        let auth = self.auth.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(AUTH_SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = auth.purge_stale();
                        if purged > 0 {
                            debug!(purged, "Swept expired auth failure blocks");
                        }
                    }
                }
            }

            debug!("Auth sweep task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals cancellation, closes the tracker, and waits for the tasks.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn record_probe(healthy: &AtomicBool, result: &Result<(), StoreError>) {
    let up = result.is_ok();
    let was_up = healthy.swap(up, Ordering::Relaxed);
    set_store_up(up);

    match result {
        Err(e) if was_up => warn!(error = %e, kind = e.kind(), "Health check: counter store is down"),
        Err(e) => trace!(error = %e, "Health check: counter store still down"),
        Ok(()) if !was_up => info!("Health check: counter store recovered"),
        Ok(()) => trace!("Health check: counter store OK"),
    }
}

/// Open the counter store selected by `config`.
///
/// # Errors
///
/// - [`StoreError::InvalidUrl`] if the Redis backend has no usable URL
/// - [`StoreError::Unavailable`] if Redis cannot be reached within the
///   configured attempts
pub async fn connect_store(config: &Config) -> Result<Arc<dyn CounterStore>, StoreError> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory counter store; limits are not shared between processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let settings = config
                .redis_settings()
                .ok_or_else(|| StoreError::InvalidUrl("REDIS_URL is not set".to_string()))?;
            let store = RedisStore::connect(&settings).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ratelimit::Counter;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn init_with_expiry(&self, _key: &str, _initial: i64, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn decrement_existing(&self, _key: &str) -> Result<Option<Counter>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let store = connect_store(&Config::default()).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }

    #[tokio::test]
    async fn test_connect_redis_without_url() {
        let config = Config {
            store_backend: StoreBackend::Redis,
            ..Config::default()
        };
        let err = connect_store(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_check_store_tracks_health() {
        let state = AppState::new(Config::default(), Arc::new(DownStore));
        assert!(state.store_healthy());

        assert!(state.check_store().await.is_err());
        assert!(!state.store_healthy());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_limiter_uses_configured_prefix() {
        let config = Config {
            key_prefix: "rw:".to_string(),
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(MemoryStore::new()));
        let key = crate::ratelimit::ClientKey::new(
            "10.0.0.1".parse().unwrap(),
            crate::ratelimit::Role::Anonymous,
        );
        assert_eq!(state.limiter.counter_key(&key), "rw:anonymous:10.0.0.1");

        state.shutdown().await;
    }
}
