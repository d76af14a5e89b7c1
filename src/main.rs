use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use conversion_hub::config::Config;
use conversion_hub::manager::ConnectionManager;
use conversion_hub::router::create_router;

const CLOSE_FLUSH_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting conversion hub...");

    // --- Configuration ---
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config/hub.toml".to_string());
    info!("Loading configuration from: {}", config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    // --- Connection manager ---
    let manager = Arc::new(ConnectionManager::new(config.manager_settings()));
    manager.start();

    let app = create_router(manager.clone());

    // --- Server ---
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind TCP listener")?;
    info!("Listening on {}", addr);

    let shutdown_manager = manager.clone();
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received, closing sockets");
        shutdown_manager.shutdown();
    });

    match server.await {
        Ok(_) => info!("Axum server finished gracefully."),
        Err(e) => error!(error = %e, "Axum server failed."),
    }

    // Socket writer tasks still hold queued close frames; let them flush
    // before the runtime is dropped.
    tokio::time::sleep(CLOSE_FLUSH_GRACE).await;

    info!("Application shut down.");
    Ok(())
}
