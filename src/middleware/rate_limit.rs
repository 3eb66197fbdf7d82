//! Per-operation rate limiting middleware.
//!
//! Attach a [`RateLimitLayer`] to a single route and method with
//! `MethodRouter::layer`, so each protected operation carries its own
//! [`RateLimitPolicy`]:
//!
//! ```rust,ignore
//! let policy = RateLimitPolicy::authenticated(Quota::new(8, 2)?)
//!     .with_anonymous(Quota::new(1, 2)?);
//! let layer = RateLimitLayer::builder()
//!     .limiter(limiter.clone())
//!     .policy(policy)
//!     .scope("hello:get")
//!     .build()?;
//! let app = Router::new().route("/hello", get(hello).layer(layer));
//! ```
//!
//! # Request Flow
//!
//! 1. Resolve the client IP. No valid address: `400`, nothing counted.
//! 2. Pick the quota for the caller's role. No quota for that role: the
//!    request passes through untouched.
//! 3. Consume a token in the shared counter store.
//! 4. Allowed: call the handler and add the headers to its response.
//! 5. Denied: build the denial (the [`OnRateLimited`] hook, or `403`) and add
//!    the headers to it.
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`: tokens per window for the applied quota
//! - `X-RateLimit-Remaining`: tokens left, never negative
//! - `X-RateLimit-Reset`: Unix time (seconds) when the window resets
//!
//! # Store Failures
//!
//! [`StoreFailurePolicy::Reject`] (default) answers `503`/`504`;
//! [`StoreFailurePolicy::Allow`] lets the request through. Neither adds
//! rate-limit headers.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use chrono::Utc;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::auth::CurrentUser;
use super::ip::{TrustedProxyConfig, resolve_client_ip};
use crate::error::AppError;
use crate::metrics::{record_decision, record_store_duration};
use crate::ratelimit::{ClientKey, Decision, RateLimitPolicy, RateLimiter};

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Write the three rate-limit headers, replacing any existing values.
pub fn write_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_timestamp()),
    );
}

/// Builds the response for a denied request.
///
/// The middleware adds the rate-limit headers to whatever this returns.
pub trait OnRateLimited: Send + Sync {
    fn on_limited(&self, decision: &Decision) -> Response<Body>;
}

impl<F> OnRateLimited for F
where
    F: Fn(&Decision) -> Response<Body> + Send + Sync,
{
    fn on_limited(&self, decision: &Decision) -> Response<Body> {
        self(decision)
    }
}

/// What to do with a request when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Answer with the dependency error (`503` or `504`).
    #[default]
    Reject,
    /// Let the request through without rate-limit headers.
    Allow,
}

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitConfigError {
    #[error("rate limit layer has no counter store; call limiter() on the builder")]
    MissingStore,

    #[error("rate limit policy needs an authenticated or an anonymous quota")]
    EmptyPolicy,
}

struct LayerConfig {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    scope: Option<Arc<str>>,
    on_limited: Option<Arc<dyn OnRateLimited>>,
    failure_policy: StoreFailurePolicy,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

/// Builder for [`RateLimitLayer`]; see the module docs.
#[derive(Default)]
pub struct RateLimitLayerBuilder {
    limiter: Option<Arc<RateLimiter>>,
    policy: RateLimitPolicy,
    scope: Option<Arc<str>>,
    on_limited: Option<Arc<dyn OnRateLimited>>,
    failure_policy: StoreFailurePolicy,
    trusted_proxies: Option<Arc<TrustedProxyConfig>>,
}

impl RateLimitLayerBuilder {
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counter namespace for this operation; operations sharing a scope share
    /// counters.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<Arc<str>>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn on_limited(mut self, on_limited: impl OnRateLimited + 'static) -> Self {
        self.on_limited = Some(Arc::new(on_limited));
        self
    }

    #[must_use]
    pub fn failure_policy(mut self, failure_policy: StoreFailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    #[must_use]
    pub fn trusted_proxies(mut self, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        self.trusted_proxies = Some(trusted_proxies);
        self
    }

    /// # Errors
    ///
    /// - [`RateLimitConfigError::MissingStore`] if no limiter was given
    /// - [`RateLimitConfigError::EmptyPolicy`] if neither role has a quota
    pub fn build(self) -> Result<RateLimitLayer, RateLimitConfigError> {
        let limiter = self.limiter.ok_or(RateLimitConfigError::MissingStore)?;
        if self.policy.is_empty() {
            return Err(RateLimitConfigError::EmptyPolicy);
        }

        Ok(RateLimitLayer {
            config: Arc::new(LayerConfig {
                limiter,
                policy: self.policy,
                scope: self.scope,
                on_limited: self.on_limited,
                failure_policy: self.failure_policy,
                trusted_proxies: self.trusted_proxies.unwrap_or_default(),
            }),
        })
    }
}

/// Rate limiting layer for one protected operation.
#[derive(Clone)]
pub struct RateLimitLayer {
    config: Arc<LayerConfig>,
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("policy", &self.config.policy)
            .field("scope", &self.config.scope)
            .field("failure_policy", &self.config.failure_policy)
            .field("custom_denial", &self.config.on_limited.is_some())
            .finish()
    }
}

impl RateLimitLayer {
    pub fn builder() -> RateLimitLayerBuilder {
        RateLimitLayerBuilder::default()
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.config.policy
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<LayerConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        // Drive the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let client_ip = resolve_client_ip(&req, &config.trusted_proxies);
        let authenticated = req.extensions().get::<CurrentUser>().is_some();

        Box::pin(async move {
            let Some(client_ip) = client_ip else {
                warn!(path = %req.uri().path(), "Rejecting request without a valid client address");
                record_decision("invalid_address", None);
                return Ok(AppError::InvalidClientAddress.into_response());
            };

            let Some((role, quota)) = config.policy.select(authenticated) else {
                record_decision("bypassed", None);
                return inner.call(req).await;
            };

            let client = ClientKey::new(client_ip, role).with_scope(config.scope.clone());

            let started = Instant::now();
            let result = config.limiter.check(&client, quota, Utc::now()).await;
            record_store_duration(started.elapsed(), result.is_ok());

            let decision = match result {
                Ok(decision) => decision,
                Err(e) => {
                    record_decision("store_error", Some(role));
                    return match config.failure_policy {
                        StoreFailurePolicy::Reject => Ok(AppError::from(e).into_response()),
                        StoreFailurePolicy::Allow => {
                            warn!(
                                error = %e,
                                client = %client,
                                "Counter store failed, allowing request without rate limit"
                            );
                            inner.call(req).await
                        }
                    };
                }
            };

            if decision.allowed {
                record_decision("allowed", Some(role));
                debug!(client = %client, remaining = decision.remaining, "Rate limit check passed");

                let mut response = inner.call(req).await?;
                write_rate_limit_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            record_decision("denied", Some(role));
            warn!(
                client = %client,
                path = %req.uri().path(),
                limit = decision.limit,
                reset = decision.reset_timestamp(),
                "Rate limit exceeded"
            );

            let mut response = match &config.on_limited {
                Some(hook) => hook.on_limited(&decision),
                None => AppError::RateLimited(decision).into_response(),
            };
            write_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::ratelimit::{Counter, CounterStore, MemoryStore, Quota, StoreError};

    fn memory_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())))
    }

    fn request(peer: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/hello").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        req
    }

    async fn call(layer: &RateLimitLayer, req: Request<Body>) -> Response<Body> {
        layer
            .layer(tower::service_fn(|_req: Request<Body>| async {
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            }))
            .oneshot(req)
            .await
            .unwrap()
    }

    fn header(response: &Response<Body>, name: &HeaderName) -> Option<i64> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().parse().unwrap())
    }

    #[test]
    fn test_builder_requires_limiter() {
        let err = RateLimitLayer::builder()
            .policy(RateLimitPolicy::anonymous(Quota::new(1, 1).unwrap()))
            .build()
            .unwrap_err();
        assert_eq!(err, RateLimitConfigError::MissingStore);
    }

    #[test]
    fn test_builder_requires_a_quota() {
        let err = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .build()
            .unwrap_err();
        assert_eq!(err, RateLimitConfigError::EmptyPolicy);
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let layer = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .policy(RateLimitPolicy::anonymous(Quota::new(3, 60).unwrap()))
            .build()
            .unwrap();

        let before = Utc::now().timestamp();
        let response = call(&layer, request("192.0.2.1:4000")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_RATELIMIT_LIMIT), Some(3));
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), Some(2));
        let reset = header(&response, &X_RATELIMIT_RESET).unwrap();
        assert!(reset >= before && reset <= Utc::now().timestamp() + 60);
    }

    #[tokio::test]
    async fn test_calls_the_inner_service_that_was_polled_ready() {
        let layer = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .policy(RateLimitPolicy::anonymous(Quota::new(5, 60).unwrap()))
            .build()
            .unwrap();
        // A concurrency limit holds its permit in the instance that was polled.
        let inner = tower::limit::ConcurrencyLimit::new(
            tower::service_fn(|_req: Request<Body>| async {
                Ok::<_, Infallible>(Response::new(Body::from("ok")))
            }),
            1,
        );

        let mut service = layer.layer(inner);
        for _ in 0..2 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("192.0.2.1:4000"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_default_denial_is_403_with_headers() {
        let layer = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .policy(RateLimitPolicy::anonymous(Quota::new(1, 60).unwrap()))
            .build()
            .unwrap();

        call(&layer, request("192.0.2.1:4000")).await;
        let response = call(&layer, request("192.0.2.1:4000")).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(header(&response, &X_RATELIMIT_LIMIT), Some(1));
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), Some(0));
        assert!(header(&response, &X_RATELIMIT_RESET).is_some());
    }

    #[tokio::test]
    async fn test_custom_denial_keeps_headers() {
        let layer = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .policy(RateLimitPolicy::anonymous(Quota::new(1, 60).unwrap()))
            .on_limited(|_: &Decision| {
                (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
            })
            .build()
            .unwrap();

        call(&layer, request("192.0.2.1:4000")).await;
        let response = call(&layer, request("192.0.2.1:4000")).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, &X_RATELIMIT_LIMIT), Some(1));
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), Some(0));
    }

    #[tokio::test]
    async fn test_unconfigured_role_passes_through_without_headers() {
        let layer = RateLimitLayer::builder()
            .limiter(memory_limiter())
            .policy(RateLimitPolicy::authenticated(Quota::new(1, 60).unwrap()))
            .build()
            .unwrap();

        for _ in 0..3 {
            let response = call(&layer, request("192.0.2.1:4000")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_invalid_client_address_consumes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let layer = RateLimitLayer::builder()
            .limiter(Arc::new(RateLimiter::new(store.clone())))
            .policy(RateLimitPolicy::anonymous(Quota::new(1, 60).unwrap()))
            .trusted_proxies(Arc::new(TrustedProxyConfig::new(&["10.0.0.0/8".to_string()])))
            .build()
            .unwrap();

        for _ in 0..2 {
            let mut req = request("10.0.0.2:4000");
            req.headers_mut()
                .insert("x-forwarded-for", "garbage".parse().unwrap());
            let response = call(&layer, req).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        }
        assert!(store.is_empty());
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn init_with_expiry(
            &self,
            _key: &str,
            _initial: i64,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }

        async fn decrement_existing(&self, _key: &str) -> Result<Option<Counter>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn backend(&self) -> &'static str {
            "down"
        }
    }

    fn down_layer(failure_policy: StoreFailurePolicy) -> RateLimitLayer {
        RateLimitLayer::builder()
            .limiter(Arc::new(RateLimiter::new(Arc::new(DownStore))))
            .policy(RateLimitPolicy::anonymous(Quota::new(1, 60).unwrap()))
            .failure_policy(failure_policy)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_failure_rejects_by_default() {
        let response = call(
            &down_layer(StoreFailurePolicy::default()),
            request("192.0.2.1:4000"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_store_failure_allow_policy() {
        let response = call(
            &down_layer(StoreFailurePolicy::Allow),
            request("192.0.2.1:4000"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
    }
}
