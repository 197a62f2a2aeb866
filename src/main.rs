use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trust_gate::{AppError, AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting trust_gate v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
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
        store = if config.redis_url.is_some() { "redis" } else { "memory" },
        failure_policy = %config.store_failure_policy,
        log_level = %config.log_level,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    // Build the service graph
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let state = AppState::connect(config).await.map_err(|e| {
        error!("Failed to initialize services: {e}");
        match e {
            AppError::StoreUnavailable(_) => exitcode::UNAVAILABLE,
            AppError::ConfigError(_) => exitcode::CONFIG,
            _ => exitcode::SOFTWARE,
        }
    })?;
    let admin_enabled = state.config.admin_enabled();
    let app = build_router(state);

    // Start server
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  GET  /ready                           - Readiness check");
    info!("  GET  /auth/session                    - Current session (bearer)");
    info!("  POST /auth/logout-all                 - Revoke all sessions (bearer)");
    if admin_enabled {
        info!("  GET|POST /admin/trusted-ips           - List / add trusted IPs");
        info!("  GET|DELETE /admin/trusted-ips/{{ip}}    - Check / remove a trusted IP");
        info!("  GET  /admin/identifiers/{{id}}          - Identifier behavior");
        info!("  DELETE /admin/identifiers/{{id}}/ban    - Lift a ban");
        info!("  POST /admin/sessions                  - Issue a session token");
        info!("  POST /admin/users/{{id}}/password-changed - Revoke pre-change tokens");
    }

    // Peer addresses feed client IP resolution when no proxy header is present
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

    info!("Server shutdown complete");
    Ok(())
}
