//! Health and readiness endpoints.
//!
//! - `GET /health` - service status with a live counter store ping
//! - `GET /ready` - readiness probe, `503` while the store is down
//!
//! Neither route is rate limited, so probes keep working for clients that
//! have exhausted their quota.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK; a failed store ping shows up as `"degraded"`.
///
/// ```json
/// {
///   "status": "healthy",
///   "store": "redis",
///   "store_connected": true,
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_connected = state.check_store().await.is_ok();

    Json(HealthResponse {
        status: if store_connected { "healthy" } else { "degraded" }.to_string(),
        store: state.store().backend().to_string(),
        store_connected,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint.
///
/// Uses the result of the last background probe rather than pinging, so a
/// burst of probes never adds load to the store.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.store_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
