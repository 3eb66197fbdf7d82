//! API key identity resolution.
//!
//! Callers are classified before any rate limit is applied:
//!
//! - no key: anonymous, the request continues without a [`CurrentUser`]
//! - valid key: a [`CurrentUser`] extension is attached to the request (and
//!   copied onto the response for the access log)
//! - invalid key: `401` with `WWW-Authenticate: API-Key`
//!
//! Keys are sent in the `X-API-Key` header (preferred) or the deprecated
//! `api_key` query parameter:
//!
//! ```bash
//! curl -H "X-API-Key: your-secret-key" http://localhost:3000/me
//! ```
//!
//! # Brute Force Protection
//!
//! Failed attempts are counted per client IP with a keyed `governor` limiter.
//! Once an IP exhausts its failure budget it is blocked until the limiter
//! would admit another attempt; while blocked, requests carrying a key are
//! answered with `429` before the key is compared at all.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{FromRequestParts, OptionalFromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{TrustedProxyConfig, resolve_client_ip};
use crate::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

pub const API_KEY_QUERY: &str = "api_key";

/// Failed attempts per IP per minute before the IP is blocked.
const AUTH_FAILURES_PER_MINUTE: u32 = 10;

/// Failures allowed in a burst before the per-minute rate applies.
const AUTH_FAILURE_BURST: u32 = 5;

type AuthFailureLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Identity of an authenticated caller.
///
/// Use as an extractor on handlers that require a user; anonymous callers get
/// `401`. `Option<CurrentUser>` accepts both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub name: Arc<str>,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("API key required".to_string()))
    }
}

impl<S> OptionalFromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<CurrentUser>().cloned())
    }
}

/// A named API key.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential {
    pub user: String,
    pub key: String,
}

impl std::fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredential")
            .field("user", &self.user)
            .field("key", &"***")
            .finish()
    }
}

impl ApiCredential {
    pub fn new(user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key: key.into(),
        }
    }
}

struct FailureTracker {
    limiter: AuthFailureLimiter,
    blocked_until: DashMap<IpAddr, Instant>,
}

impl FailureTracker {
    fn new() -> Self {
        let per_minute = NonZeroU32::new(AUTH_FAILURES_PER_MINUTE).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(AUTH_FAILURE_BURST).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute).allow_burst(burst)),
            blocked_until: DashMap::new(),
        }
    }

    /// Remaining block for `ip`, clearing it once it has passed.
    fn blocked_for(&self, ip: &IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let until = *self.blocked_until.get(ip)?;
        if until > now {
            return Some(until - now);
        }
        self.blocked_until.remove_if(ip, |_, until| *until <= now);
        None
    }

    /// Drop blocks that ended before `now` and limiter state for IPs whose
    /// failure budget has refilled. Returns the number of blocks removed.
    fn purge_stale(&self, now: Instant) -> usize {
        let before = self.blocked_until.len();
        self.blocked_until.retain(|_, until| *until > now);
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.blocked_until.len())
    }

    /// Count a failure; returns the block duration if `ip` is now blocked.
    fn record_failure(&self, ip: IpAddr) -> Option<Duration> {
        match self.limiter.check_key(&ip) {
            Ok(_) => None,
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                self.blocked_until.insert(ip, Instant::now() + wait);
                Some(wait)
            }
        }
    }
}

/// API key identity layer.
///
/// With no credentials configured every presented key is invalid, and every
/// caller without a key is anonymous.
#[derive(Clone)]
pub struct ApiKeyAuth {
    credentials: Arc<Vec<ApiCredential>>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    failures: Arc<FailureTracker>,
}

impl ApiKeyAuth {
    pub fn new(credentials: Vec<ApiCredential>, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        Self {
            credentials: Arc::new(credentials),
            trusted_proxies,
            failures: Arc::new(FailureTracker::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Forget expired IP blocks and idle failure counters.
    ///
    /// Called periodically from the background task in `AppState`.
    pub fn purge_stale(&self) -> usize {
        self.failures.purge_stale(Instant::now())
    }
}

impl<S> Layer<S> for ApiKeyAuth {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    auth: ApiKeyAuth,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        // Drive the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(extracted) = extract_api_key(&req) else {
                return inner.call(req).await;
            };

            let client_ip = resolve_client_ip(&req, &auth.trusted_proxies)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

            if let Some(wait) = auth.failures.blocked_for(&client_ip) {
                let retry_after = wait.as_secs().max(1);
                error!(
                    client_ip = %client_ip,
                    retry_after_secs = retry_after,
                    "IP blocked due to excessive auth failures"
                );
                return Ok(AppError::AuthThrottled { retry_after }.into_response());
            }

            match find_user(&auth.credentials, &extracted.key) {
                Some(user) => {
                    debug!(
                        user = %user.name,
                        from_query = extracted.from_query,
                        "API key authentication successful"
                    );
                    req.extensions_mut().insert(user.clone());
                    let mut response = inner.call(req).await?;
                    response.extensions_mut().insert(user);
                    Ok(response)
                }
                None => {
                    warn!(
                        path = %req.uri().path(),
                        client_ip = %client_ip,
                        "Invalid API key provided"
                    );
                    if let Some(wait) = auth.failures.record_failure(client_ip) {
                        return Ok(AppError::AuthThrottled {
                            retry_after: wait.as_secs().max(1),
                        }
                        .into_response());
                    }
                    Ok(AppError::Unauthorized("Invalid API key".to_string()).into_response())
                }
            }
        })
    }
}

struct ExtractedApiKey {
    key: String,
    from_query: bool,
}

/// API key from the `X-API-Key` header, else the `api_key` query parameter.
fn extract_api_key<B>(req: &Request<B>) -> Option<ExtractedApiKey> {
    if let Some(header_value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = header_value.to_str()
    {
        return Some(ExtractedApiKey {
            key: value.to_string(),
            from_query: false,
        });
    }

    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(req.uri()).ok()?;
    let value = params.get(API_KEY_QUERY)?;

    warn!(
        path = %req.uri().path(),
        "DEPRECATED: API key provided via query parameter, use the X-API-Key header"
    );
    Some(ExtractedApiKey {
        key: value.clone(),
        from_query: true,
    })
}

/// Compare against every credential so timing does not reveal which matched.
fn find_user(credentials: &[ApiCredential], provided: &str) -> Option<CurrentUser> {
    credentials.iter().fold(None, |found, credential| {
        let matches = constant_time_eq(provided, &credential.key);
        match found {
            Some(user) => Some(user),
            None if matches => Some(CurrentUser {
                name: Arc::from(credential.user.as_str()),
            }),
            None => None,
        }
    })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
