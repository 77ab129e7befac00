//! warren node agent
//!
//! The agent runs on every worker host. It registers with the brain,
//! heartbeats on the assigned cadence, and executes instance commands:
//! pulling template archives into a local cache, assembling per-instance
//! workspaces, and reporting each lifecycle transition back via callbacks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warren_node_agent::{
    api,
    client::BrainClient,
    config::Config,
    heartbeat,
    instance::InstanceManager,
    state::AppState,
    storage::{FsTemplateStorage, HttpTemplateStorage, TemplateStorage},
    template::{CacheLayout, CacheManager, TemplateCache},
    workspace::Workspace,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WARREN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting warren node agent");
    info!(
        listen_addr = %config.listen_addr,
        brain_url = %config.brain_url,
        cache_root = %config.cache_root.display(),
        workspace_root = %config.workspace_root.display(),
        "Configuration loaded"
    );

    // Set up the template cache
    let layout = CacheLayout::new(&config.cache_root);
    std::fs::create_dir_all(layout.templates_root()).with_context(|| {
        format!(
            "Failed to create template cache directory at {}",
            layout.templates_root().display()
        )
    })?;

    let storage: Arc<dyn TemplateStorage> = if let Some(endpoint) = &config.storage_endpoint {
        Arc::new(
            HttpTemplateStorage::new(endpoint, &config.storage_bucket, config.storage_timeout)
                .context("Failed to build template storage client")?,
        )
    } else if let Some(dir) = &config.storage_dir {
        Arc::new(FsTemplateStorage::new(dir))
    } else {
        // validate() rejects configurations without a storage backend.
        bail!("no template storage backend configured");
    };

    let cache = Arc::new(TemplateCache::new(
        layout.clone(),
        storage,
        config.cache_config(),
    ));

    if config.cache_check {
        if let Err(e) = cache.check_cached_versions() {
            warn!(error = %e, "Cache check did not complete");
        }
    }

    // Set up instance workspaces
    let workspace = Arc::new(Workspace::new(&config.workspace_root));
    std::fs::create_dir_all(workspace.instances_root()).with_context(|| {
        format!(
            "Failed to create instance workspace directory at {}",
            workspace.instances_root().display()
        )
    })?;

    // Register with the brain before accepting commands
    let client = Arc::new(
        BrainClient::new(&config.brain_url, config.request_timeout)
            .context("Failed to build brain client")?,
    );

    let registration = tokio::select! {
        response = heartbeat::register_until_success(&client, &config) => response,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal during registration");
            return Ok(());
        }
    };

    let node_id = registration.node_id;
    let heartbeat_interval = config
        .heartbeat_interval_override
        .unwrap_or(Duration::from_secs(registration.heartbeat_interval_seconds));

    let instances = InstanceManager::new(
        Arc::clone(&cache),
        Arc::clone(&workspace),
        Arc::clone(&client),
        node_id,
        config.max_substitution_bytes,
    );
    let cache_manager = CacheManager::new(layout);
    let state = AppState::new(instances, cache_manager, node_id);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the heartbeat loop in background
    let heartbeat_handle = tokio::spawn({
        let client = Arc::clone(&client);
        let workspace = Arc::clone(&workspace);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            heartbeat::run_heartbeat_loop(
                client,
                workspace,
                node_id,
                heartbeat_interval,
                shutdown_rx,
            )
            .await;
        }
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for brain commands");

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
    info!("Waiting for heartbeat loop to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, heartbeat_handle).await {
        warn!(error = %e, "Heartbeat loop did not shut down in time");
    }

    info!("Node agent shutdown complete");
    Ok(())
}
