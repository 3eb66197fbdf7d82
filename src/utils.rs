use std::time::Duration;

use rand::Rng;
use tokio::signal;
use tracing::{error, warn};

/// Jitter applied to retry delays (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Retry delays never drop below this, whatever the jitter.
const MIN_RETRY_DELAY_MS: u64 = 100;

/// Delay before retry number `attempt` (1-based).
///
/// Exponential in `base`, capped at `max`, then jittered by
/// ±[`BACKOFF_JITTER_PERCENT`] and floored at [`MIN_RETRY_DELAY_MS`].
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(max_ms);

    let jitter = rand::rng().random_range(-1.0..=1.0) * BACKOFF_JITTER_PERCENT;
    let jittered = (delay_ms as f64 * (1.0 + jitter)) as u64;

    Duration::from_millis(jittered.max(MIN_RETRY_DELAY_MS))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// If one of the handlers cannot be installed the error is logged and the
/// other signal still triggers shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
