//! Fixed-window token counter over a [`CounterStore`].

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use super::policy::{Quota, Role};
use super::store::{CounterStore, StoreError};

/// Default prefix for counter keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

/// How many times a counter that vanished mid-update is re-initialized.
const MAX_INIT_ATTEMPTS: usize = 3;

/// Identity a counter is kept for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub addr: IpAddr,
    pub role: Role,
    /// Protected operation the counter belongs to, e.g. `"hello:get"`.
    pub scope: Option<Arc<str>>,
}

impl ClientKey {
    pub fn new(addr: IpAddr, role: Role) -> Self {
        Self {
            addr,
            role,
            scope: None,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Option<Arc<str>>) -> Self {
        self.scope = scope;
        self
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = &self.scope {
            write!(f, "{scope}:")?;
        }
        write!(f, "{}:{}", self.role, self.addr)
    }
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub limit: u32,
    /// Tokens left in the window, never negative.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub allowed: bool,
}

impl Decision {
    fn from_counter(quota: Quota, value: i64, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        let ttl = TimeDelta::try_seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX);

        Self {
            limit: quota.tokens(),
            remaining: u32::try_from(value.max(0)).unwrap_or(u32::MAX),
            reset_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            allowed: value >= 0,
        }
    }

    /// Reset time as Unix seconds, as sent in `X-RateLimit-Reset`.
    pub fn reset_timestamp(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Counts requests per [`ClientKey`] in the shared store.
///
/// The limiter itself holds no per-client state and does not log; callers
/// decide what to do with a [`Decision`] or a [`StoreError`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    key_prefix: Arc<str>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            key_prefix: Arc::from(DEFAULT_KEY_PREFIX),
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Store key for a client: `<prefix>[<scope>:]<role>:<ip>`.
    pub fn counter_key(&self, client: &ClientKey) -> String {
        format!("{}{}", self.key_prefix, client)
    }

    /// Consume one token for `client` under `quota`.
    ///
    /// The first request in a window creates the counter at `tokens - 1`
    /// with the window as its expiry; later requests decrement it. The
    /// request is allowed while the counter is not negative.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`] from the store, or [`StoreError::Contended`] if the
    /// counter expired between initialization and decrement on every attempt.
    pub async fn check(
        &self,
        client: &ClientKey,
        quota: Quota,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let key = self.counter_key(client);
        let initial = i64::from(quota.tokens()) - 1;

        for _ in 0..MAX_INIT_ATTEMPTS {
            if self
                .store
                .init_with_expiry(&key, initial, quota.window())
                .await?
            {
                return Ok(Decision::from_counter(
                    quota,
                    initial,
                    u64::from(quota.window_secs()),
                    now,
                ));
            }

            if let Some(counter) = self.store.decrement_existing(&key).await? {
                return Ok(Decision::from_counter(
                    quota,
                    counter.value,
                    counter.ttl_secs,
                    now,
                ));
            }
        }

        Err(StoreError::Contended(key))
    }
}
