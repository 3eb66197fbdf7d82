//! Prometheus metrics.
//!
//! The exporter is installed explicitly by [`init_metrics`] at startup; until
//! then the `record_*` functions are no-ops, which is what tests rely on.
//!
//! # Available Metrics
//!
//! - `ratewrap_ratelimit_decisions_total` (counter; `outcome`, `role`):
//!   `allowed`, `denied`, `bypassed`, `store_error`, `invalid_address`
//! - `ratewrap_store_duration_seconds` (histogram; `result`): one limiter
//!   check against the counter store
//! - `ratewrap_http_request_duration_seconds` (histogram; `method`, `status`)
//! - `ratewrap_store_up` (gauge): 1 when the last store probe succeeded

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::ratelimit::Role;

/// Metric names as constants for consistency.
pub mod names {
    pub const RATELIMIT_DECISIONS_TOTAL: &str = "ratewrap_ratelimit_decisions_total";
    pub const STORE_DURATION_SECONDS: &str = "ratewrap_store_duration_seconds";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "ratewrap_http_request_duration_seconds";
    pub const STORE_UP: &str = "ratewrap_store_up";
}

/// Install the Prometheus exporter listening on `metrics_addr`.
///
/// # Errors
///
/// Returns a message if the exporter (or its listener) cannot be installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATELIMIT_DECISIONS_TOTAL,
        "Rate limit decisions by outcome and caller role"
    );
    describe_histogram!(
        names::STORE_DURATION_SECONDS,
        "Duration of a rate limit check against the counter store in seconds"
    );
    describe_histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(
        names::STORE_UP,
        "Counter store reachability (1 = up, 0 = down)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Like [`init_metrics`], but logs failures and continues without metrics.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_decision(outcome: &'static str, role: Option<Role>) {
    let role = role.map_or("none", |r| r.as_str());
    counter!(names::RATELIMIT_DECISIONS_TOTAL, "outcome" => outcome, "role" => role).increment(1);
}

pub fn record_store_duration(elapsed: Duration, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    histogram!(names::STORE_DURATION_SECONDS, "result" => result).record(elapsed.as_secs_f64());
}

pub fn record_request_duration(method: &str, status: u16, elapsed: Duration) {
    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn set_store_up(up: bool) {
    gauge!(names::STORE_UP).set(if up { 1.0 } else { 0.0 });
}
