//! HTTP middleware: identity, rate limiting, and request lifecycle hooks.
//!
//! - **Access log**: one structured event per request
//! - **Request ID**: generation and propagation of `X-Request-Id`
//! - **API key identity**: authenticated vs anonymous callers
//! - **Rate limiting**: per-operation quotas over a shared counter store
//! - **Client address**: peer address with trusted-proxy header handling
//!
//! # Architecture
//!
//! ```text
//! Request → Access Log → Request ID → CORS → Auth → Body Limit → Route
//!                                              ↓                   ↓
//!                                       401 / CurrentUser   Rate Limit (per method)
//!                                                            ↓
//!                                              400 / 403 / 503 / 504 + X-RateLimit-*
//! ```

pub mod access_log;
pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

pub use access_log::access_log;
pub use auth::{ApiCredential, ApiKeyAuth, CurrentUser};
pub use ip::{CidrRange, TrustedProxyConfig, resolve_client_ip};
pub use rate_limit::{
    OnRateLimited, RateLimitConfigError, RateLimitLayer, RateLimitLayerBuilder,
    StoreFailurePolicy, write_rate_limit_headers,
};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer};
