//! foreman daemon — serves the dispatch API and runs the background sweeps.

use anyhow::{Context, Result};
use fm_core::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config (or use defaults) before logging so the level knob applies.
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    let log_options = fm_telemetry::logging::LogOptions {
        level: config.general.log_level.clone(),
        format: config.general.log_format.parse().unwrap_or_else(|e| {
            eprintln!("{e}, falling back to text");
            fm_telemetry::logging::LogFormat::Text
        }),
    };
    fm_telemetry::logging::init_logging("fm-daemon", &log_options);
    info!(version = env!("CARGO_PKG_VERSION"), "foreman daemon starting");

    let bind_addr = format!("{}:{}", config.bridge.host, config.bridge.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind dispatch listener on {bind_addr}"))?;
    let port = listener.local_addr()?.port();
    info!(port, "dispatch listener bound");

    let daemon = fm_daemon::Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    info!("dispatch API: http://localhost:{port}/jobs");
    daemon.run_with_listener(listener).await
}
