//! Rate limited demo endpoints.
//!
//! - `GET /hello?name=..` and `POST /hello` - greet the caller
//! - `GET /me` - the authenticated caller, `401` for anonymous callers
//!
//! Quotas are attached per route and method in [`crate::routes`].

use axum::Json;
use axum::body::Body;
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;

use crate::error::AppResult;
use crate::middleware::{CurrentUser, OnRateLimited};
use crate::models::{GreetingRequest, GreetingResponse, MeResponse};
use crate::ratelimit::Decision;
use crate::validation::Validated;

pub async fn hello(
    user: Option<CurrentUser>,
    Validated(req): Validated<GreetingRequest>,
) -> AppResult<Json<GreetingResponse>> {
    let greeting = format!("Hello, {}!", req.name);
    let message = if req.shout {
        greeting.to_uppercase()
    } else {
        greeting
    };

    Ok(Json(GreetingResponse {
        message,
        user: user.map(|u| u.name.to_string()),
        correlation_id: req.correlation_id(),
    }))
}

pub async fn me(user: CurrentUser) -> Json<MeResponse> {
    Json(MeResponse {
        user: user.name.to_string(),
    })
}

/// Denial for write operations: `429` with `Retry-After` instead of the
/// default `403`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlowDown;

impl OnRateLimited for SlowDown {
    fn on_limited(&self, decision: &Decision) -> Response<Body> {
        let retry_after = (decision.reset_at - Utc::now()).num_seconds().max(0);
        let body = json!({
            "error": "slow_down",
            "message": format!("Too many requests. Retry in {retry_after}s."),
        });

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_slow_down_sets_retry_after() {
        let decision = Decision {
            limit: 3,
            remaining: 0,
            reset_at: Utc::now() + Duration::seconds(30),
            allowed: false,
        };
        let response = SlowDown.on_limited(&decision);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: i64 = response.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((29..=30).contains(&retry_after), "{retry_after}");
    }

    #[test]
    fn test_slow_down_never_negative() {
        let decision = Decision {
            limit: 3,
            remaining: 0,
            reset_at: Utc::now() - Duration::seconds(5),
            allowed: false,
        };
        let response = SlowDown.on_limited(&decision);
        assert_eq!(response.headers()[RETRY_AFTER], "0");
    }
}
