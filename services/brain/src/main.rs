//! warren brain
//!
//! The brain is the control plane for the warren game-server fleet. It owns
//! the node registry, the instance lifecycle, and the template catalog,
//! drives node agents over HTTP, and fails whatever stops reporting back.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warren_brain::{
    api,
    config::Config,
    dispatch::Dispatcher,
    monitor::{HeartbeatMonitor, StaleInstanceMonitor},
    registry::Registry,
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WARREN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting warren brain");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let dispatcher = Dispatcher::new(&config).context("Failed to build dispatch client")?;
    let state = AppState::new(Registry::new(), dispatcher, config.clone());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start heartbeat monitor in background
    let heartbeat_monitor = HeartbeatMonitor::new(state.clone());
    let heartbeat_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            heartbeat_monitor.run(shutdown_rx).await;
        }
    });

    // Start stale instance monitor in background
    let stale_monitor = StaleInstanceMonitor::new(state.clone());
    let stale_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            stale_monitor.run(shutdown_rx).await;
        }
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for monitors to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, heartbeat_handle).await {
        warn!(error = %e, "Heartbeat monitor did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, stale_handle).await {
        warn!(error = %e, "Stale instance monitor did not shut down in time");
    }

    info!("Brain shutdown complete");
    Ok(())
}
