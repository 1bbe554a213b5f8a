use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_agent::connection::{ConnectionManager, TcpDialer};
use keel_agent::runtime::{PodmanRuntime, podman};
use keel_agent::{Config, Coordinator};
use keel_client::DispatchClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Agent...");

    let config = load_config()?;
    info!("Node ID: {}", config.node_id);
    info!("Dispatch server: {} (stream {})", config.server_url, config.stream_addr);
    info!("Max parallel pipelines: {}", config.max_parallel);

    podman::check_podman_available()
        .await
        .context("Podman is required to run pipelines")?;

    // the coordinator closes the connection once final reports are sent
    let token = CancellationToken::new();
    let connection = Arc::new(ConnectionManager::new(
        config.node_id.clone(),
        DispatchClient::new(config.server_url.clone()),
        Box::new(TcpDialer::new(config.stream_addr.clone())),
        config.retry.clone(),
        CancellationToken::new(),
    ));
    let coordinator = Coordinator::new(
        config,
        connection,
        Arc::new(PodmanRuntime::default()),
        token.clone(),
    );

    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
        info!("Shutting down");
        shutdown.cancel();
    });

    coordinator.run().await
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
