use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewrap::ratelimit::StoreError;
use ratewrap::{AppState, Config, build_router, connect_store, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!("Starting ratewrap v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        store = %config.store_backend,
        key_prefix = %config.key_prefix,
        "Configuration loaded"
    );

    // Metrics exporter (optional)
    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Connect the counter store
    info!(backend = %config.store_backend, "Connecting to counter store...");
    let store = connect_store(&config).await.map_err(|e| {
        error!("Failed to connect to counter store: {e}");
        match e {
            StoreError::InvalidUrl(_) => exitcode::CONFIG,
            _ => exitcode::UNAVAILABLE,
        }
    })?;
    info!(backend = store.backend(), "Counter store ready");

    // Build application state and router
    let state = AppState::new(config.clone(), store);
    let app = build_router(state.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health  - Health check");
    info!("  GET  /ready   - Readiness check");
    info!("  GET  /hello   - Greeting (rate limited)");
    info!("  POST /hello   - Greeting (rate limited, 429 on denial)");
    info!("  GET  /me      - Authenticated caller");

    // Peer addresses are needed to key rate limits by client IP
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
