//! Per-client rate limiting over a shared counter store.
//!
//! - [`policy`]: quotas per caller role, validated at construction
//! - [`limiter`]: the fixed-window counting algorithm
//! - [`store`]: the counter store trait with Redis and in-memory backends
//!
//! The HTTP side (headers, denial responses, store failure policy) lives in
//! [`crate::middleware::rate_limit`].

pub mod limiter;
pub mod policy;
pub mod store;

pub use limiter::{ClientKey, DEFAULT_KEY_PREFIX, Decision, RateLimiter};
pub use policy::{Quota, QuotaError, RateLimitPolicy, Role};
pub use store::{Counter, CounterStore, MemoryStore, RedisSettings, RedisStore, StoreError};
