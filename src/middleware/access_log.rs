//! One structured log event per request.
//!
//! Runs outermost, so it sees the final status of every response, including
//! rejections produced by the auth and rate limit layers. The caller and the
//! request id are read from response extensions, where the inner layers leave
//! them.
//!
//! Level follows the status: `error` for 5xx, `warn` for 4xx, `info`
//! otherwise.

use std::time::Instant;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};

use super::auth::CurrentUser;
use super::request_id::RequestId;
use crate::metrics::record_request_duration;

pub async fn access_log(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status();
    record_request_duration(method.as_str(), status.as_u16(), elapsed);

    let user = response
        .extensions()
        .get::<CurrentUser>()
        .map(|u| u.name.to_string());
    let request_id = response
        .extensions()
        .get::<RequestId>()
        .map(|id| id.to_string());
    let ms = elapsed.as_secs_f64() * 1000.0;
    let reason = status.canonical_reason().unwrap_or("");

    match level(status) {
        Level::Error => error!(
            status = status.as_u16(),
            %method,
            %uri,
            reason,
            ms,
            user = user.as_deref(),
            request_id = request_id.as_deref(),
            "request"
        ),
        Level::Warn => warn!(
            status = status.as_u16(),
            %method,
            %uri,
            reason,
            ms,
            user = user.as_deref(),
            request_id = request_id.as_deref(),
            "request"
        ),
        Level::Info => info!(
            status = status.as_u16(),
            %method,
            %uri,
            reason,
            ms,
            user = user.as_deref(),
            request_id = request_id.as_deref(),
            "request"
        ),
    }

    response
}

#[derive(Debug, PartialEq, Eq)]
enum Level {
    Error,
    Warn,
    Info,
}

fn level(status: StatusCode) -> Level {
    if status.is_server_error() {
        Level::Error
    } else if status.is_client_error() {
        Level::Warn
    } else {
        Level::Info
    }
}
