//! Redis-backed counter store.
//!
//! Initialization uses `SET key value NX EX ttl`. The decrement runs as a Lua
//! script so the existence check, `DECR` and `TTL` happen in one atomic step
//! on the server and a missing key is never recreated without an expiry.
//!
//! Every command is bounded by the configured operation timeout. The
//! connection is a [`ConnectionManager`], which reconnects on its own after
//! the initial connection succeeds.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use super::{Counter, CounterStore, StoreError};
use crate::utils::backoff_delay;

/// Decrement `KEYS[1]` only if it exists; returns `{value, ttl}` or nil.
const DECREMENT_EXISTING_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return nil
end
local value = redis.call('DECR', KEYS[1])
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    ttl = 0
end
return {value, ttl}
";

/// Connection settings for [`RedisStore::connect`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    /// Upper bound for each command round trip.
    pub operation_timeout: Duration,
    /// Initial connection attempts before giving up (at least one is made).
    pub connect_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            operation_timeout: Duration::from_millis(500),
            connect_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    operation_timeout: Duration,
    decrement: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis, retrying with exponential backoff.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidUrl`] if the URL cannot be parsed (not retried)
    /// - [`StoreError::Unavailable`] / [`StoreError::Timeout`] from the last
    ///   attempt once all attempts are used up
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let client =
            Client::open(settings.url.as_str()).map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
        let attempts = settings.connect_attempts.max(1);

        let mut attempt = 1;
        loop {
            let result = timeout(
                settings.operation_timeout,
                ConnectionManager::new(client.clone()),
            )
            .await;

            let error = match result {
                Ok(Ok(conn)) => {
                    info!(attempt, "Connected to Redis counter store");
                    return Ok(Self {
                        conn,
                        operation_timeout: settings.operation_timeout,
                        decrement: Script::new(DECREMENT_EXISTING_SCRIPT),
                    });
                }
                Ok(Err(e)) => map_redis_error(e),
                Err(_) => StoreError::Timeout(settings.operation_timeout),
            };

            if attempt >= attempts {
                warn!(attempts, error = %error, "Giving up connecting to Redis");
                return Err(error);
            }

            let delay = backoff_delay(
                attempt,
                settings.retry_base_delay,
                settings.retry_max_delay,
            );
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Redis connection failed, retrying"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.operation_timeout, op).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(StoreError::Timeout(self.operation_timeout)),
        }
    }
}

fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Unavailable(e.to_string())
    } else if e.is_timeout() {
        StoreError::Unavailable(format!("redis timeout: {e}"))
    } else {
        StoreError::Protocol(e.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn init_with_expiry(
        &self,
        key: &str,
        initial: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .bounded(
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(initial)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn decrement_existing(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<(i64, i64)> = self
            .bounded(self.decrement.key(key).invoke_async(&mut conn))
            .await?;

        Ok(reply.map(|(value, ttl)| Counter {
            value,
            ttl_secs: u64::try_from(ttl).unwrap_or(0),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .bounded(::redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply '{reply}'")))
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let settings = RedisSettings::new("not a url");
        let err = RedisStore::connect(&settings).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidUrl(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        // Port 1 on localhost refuses connections.
        let settings = RedisSettings {
            connect_attempts: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(1),
            ..RedisSettings::new("redis://127.0.0.1:1")
        };
        let err = RedisStore::connect(&settings).await.unwrap_err();
        assert!(
            matches!(err, StoreError::Unavailable(_) | StoreError::Timeout(_)),
            "{err:?}"
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = RedisSettings::new("redis://localhost:6379");
        assert_eq!(settings.operation_timeout, Duration::from_millis(500));
        assert_eq!(settings.connect_attempts, 5);
    }
}
