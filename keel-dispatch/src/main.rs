use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_dispatch::dispatch::listener;
use keel_dispatch::service::node_service;
use keel_dispatch::{AppState, Config, api};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_dispatch=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Dispatch Server...");

    let config = load_config()?;
    info!(
        "Heartbeat period: {:?}, max pipelines per node: {}",
        config.heartbeat_period, config.max_pipelines_per_node
    );

    let state = AppState::in_memory(&config);
    let token = CancellationToken::new();

    // Background tasks
    let sweeper = {
        let dispatch = state.dispatch.clone();
        let token = token.clone();
        tokio::spawn(async move { dispatch.run_liveness_sweep(token).await })
    };
    let tracker = tokio::spawn(node_service::track_liveness(
        state.clone(),
        state.dispatch.watch_liveness(),
        token.clone(),
    ));

    // Node streams
    let stream_listener = tokio::net::TcpListener::bind(&config.stream_addr)
        .await
        .with_context(|| format!("Failed to bind stream listener to {}", config.stream_addr))?;
    let streams = tokio::spawn(listener::serve(
        stream_listener,
        state.dispatch.clone(),
        token.clone(),
    ));

    // HTTP API
    let app = api::create_router(state);
    let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener to {}", config.http_addr))?;
    info!("Listening on {}", config.http_addr);

    let shutdown = token.clone();
    axum::serve(http_listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    token.cancel();
    let _ = tokio::join!(sweeper, tracker);
    streams.await?.context("Stream listener failed")?;

    Ok(())
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
