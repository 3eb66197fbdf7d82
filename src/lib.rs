//! # ratewrap
//!
//! Per-operation HTTP rate limiting for Axum services, backed by a counter
//! store shared across every process (Redis in production):
//!
//! - **Quotas per role**: separate token budgets for authenticated and
//!   anonymous callers, per route and method
//! - **Standard headers**: `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
//!   `X-RateLimit-Reset` on allowed and denied responses
//! - **Honest failures**: a store outage is `503`/`504`, never a `403`
//! - **Request lifecycle**: request ids, API key identity, validation, and
//!   one access log event per request
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Access Log → Request ID → CORS → Auth)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimitLayer (per route + method)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RateLimiter (fixed window, one token per request)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CounterStore (RedisStore / MemoryStore)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratewrap::{AppState, Config, build_router, connect_store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = connect_store(&config).await?;
//!
//!     let state = AppState::new(config, store);
//!     let app = build_router(state)?;
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Protecting Your Own Routes
//!
//! ```rust,ignore
//! let layer = RateLimitLayer::builder()
//!     .limiter(limiter.clone())
//!     .policy(RateLimitPolicy::anonymous(Quota::new(60, 3600)?))
//!     .scope("search:get")
//!     .build()?;
//! let app = Router::new().route("/search", get(search).layer(layer));
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validation;
pub mod validators;

// Re-exports for convenience
pub use config::{Config, StoreBackend};
pub use error::{AppError, AppResult};
pub use ratelimit::{CounterStore, Decision, MemoryStore, Quota, RateLimitPolicy, RateLimiter, RedisStore};
pub use routes::build_router;
pub use state::{AppState, connect_store};
