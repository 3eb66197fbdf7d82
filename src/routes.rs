//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │    Access Log    │ ← one event per request, final status
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401 for a bad key, CurrentUser for a good one
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Rate Limit     │ ← per route and method; 400 / 403 / 429 / 503 / 504
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `/health`, `/ready` - not rate limited
//! - `GET /hello` - default quotas, scope `hello:get`
//! - `POST /hello` - default quotas, scope `hello:post`, `429` on denial
//! - `GET /me` - authenticated quota only
//! - anything else - `404`, not rate limited

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::handlers;
use crate::middleware::{RateLimitConfigError, RateLimitLayer, RequestIdLayer, access_log};
use crate::ratelimit::RateLimitPolicy;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Errors
///
/// Returns `RateLimitConfigError` if a route's rate limit layer cannot be
/// built (e.g. both default quotas are disabled).
pub fn build_router(state: AppState) -> Result<Router, RateLimitConfigError> {
    let config = state.config.clone();
    let policy = config.default_policy();

    let limit = |scope: &str, policy: RateLimitPolicy| {
        RateLimitLayer::builder()
            .limiter(state.limiter.clone())
            .policy(policy)
            .scope(scope)
            .failure_policy(config.store_failure_policy())
            .trusted_proxies(state.trusted_proxies.clone())
    };

    info!(
        authenticated = ?config.authenticated_quota.map(|q| q.to_string()),
        anonymous = ?config.anonymous_quota.map(|q| q.to_string()),
        failure_policy = ?config.store_failure_policy(),
        "Rate limiting enabled"
    );

    let mut router = Router::new()
        // Health and status endpoints (never rate limited)
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route(
            "/hello",
            get(handlers::hello).layer(limit("hello:get", policy).build()?),
        )
        .route(
            "/hello",
            post(handlers::hello).layer(
                limit("hello:post", policy)
                    .on_limited(handlers::SlowDown)
                    .build()?,
            ),
        )
        .fallback(handlers::not_found);

    router = match config.authenticated_quota {
        Some(quota) => router.route(
            "/me",
            get(handlers::me).layer(limit("me:get", RateLimitPolicy::authenticated(quota)).build()?),
        ),
        None => {
            info!("No authenticated quota configured, /me is not rate limited");
            router.route("/me", get(handlers::me))
        }
    };

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_kb = config.max_request_body_size / 1024,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Authentication (without keys, every caller is anonymous and any
    //    presented key is rejected)
    let auth_layer = state.auth.clone();
    if auth_layer.is_enabled() {
        info!(keys = config.api_keys.len(), "API key authentication enabled");
    } else {
        info!("No API_KEYS configured, all callers are anonymous");
    }
    router = router.layer(auth_layer);

    // 3. CORS
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 4. Request ID
    router = router.layer(RequestIdLayer::new());

    // 5. Access log (outermost, sees every final status)
    router = router.layer(axum::middleware::from_fn(access_log));

    Ok(router.with_state(state))
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin; otherwise only the listed origins are allowed.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allow_any {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::ratelimit::MemoryStore;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_build_router_rejects_empty_policy() {
        let config = Config {
            authenticated_quota: None,
            anonymous_quota: None,
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(MemoryStore::new()));

        let err = build_router(state.clone()).err().unwrap();
        assert_eq!(err, RateLimitConfigError::EmptyPolicy);

        state.shutdown().await;
    }
}
