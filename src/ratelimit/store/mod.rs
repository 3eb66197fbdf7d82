//! Counter store abstraction.
//!
//! The limiter needs two atomic primitives from its backing store:
//!
//! - create a counter with an expiry only if it does not exist
//! - decrement an existing counter and report its remaining time to live
//!
//! The decrement must never create a key. A key that expired between the two
//! calls is reported as absent so the caller can re-initialize it with a
//! proper expiry.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisSettings, RedisStore};

/// Counter state after a decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value after the decrement. Negative once the window is exhausted.
    pub value: i64,
    /// Whole seconds until the counter expires.
    pub ttl_secs: u64,
}

/// Errors returned by a [`CounterStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply from counter store: {0}")]
    Protocol(String),

    #[error("counter '{0}' expired repeatedly during update")]
    Contended(String),

    #[error("invalid counter store url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout(_) => "timeout",
            StoreError::Protocol(_) => "protocol",
            StoreError::Contended(_) => "contended",
            StoreError::InvalidUrl(_) => "invalid_url",
        }
    }
}

/// Shared key-value store holding rate limit counters.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers on the same key, across every process sharing the store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Set `key` to `initial` with expiry `ttl` if it does not exist.
    ///
    /// Returns `true` when the counter was created by this call.
    async fn init_with_expiry(
        &self,
        key: &str,
        initial: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Decrement `key` by one if it exists.
    ///
    /// Returns `None` without touching the store when the key is absent.
    async fn decrement_existing(&self, key: &str) -> Result<Option<Counter>, StoreError>;

    /// Round trip to the store, used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}
