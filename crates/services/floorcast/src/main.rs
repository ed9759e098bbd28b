//! Floorcast broadcaster binary
//!
//! Reconciles control-plane state left by a previous run, then serves the
//! session API for the display layer.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floorcast::{
    api::{build_router, AppState},
    config::Config,
    control_plane::HttpControlPlane,
    lifecycle::LifecycleManager,
    session::{FfmpegPipelineFactory, Session},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Floorcast broadcaster...");

    // Load configuration
    let config_path = std::env::var("FLOORCAST_CONFIG").ok();
    let config = Config::load(config_path.as_deref())?;
    config.validate_broadcaster()?;
    let config = Arc::new(config);

    tracing::info!(
        "Configuration: API port={}, relay={}, chunk interval={}ms",
        config.server.api_port,
        config.relay.url,
        config.capture.chunk_interval_ms
    );

    let control_plane = Arc::new(HttpControlPlane::new(&config.control_plane)?);
    let lifecycle = Arc::new(LifecycleManager::new(control_plane));

    // Unwind anything a crashed run left behind; sessions retry this if it fails
    if let Err(e) = lifecycle.reconcile().await {
        tracing::warn!("Startup reconcile failed: {}", e);
    }

    let pipeline = Arc::new(FfmpegPipelineFactory::new(
        config.capture.clone(),
        config.relay.clone(),
    ));
    let session = Session::new(lifecycle, pipeline);

    let state = AppState::new(session.clone(), config.clone());
    let router = build_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    // Release the ingestor and stream before exiting
    if let Err(e) = session.stop().await {
        tracing::warn!("Session teardown on shutdown was incomplete: {}", e);
    }

    tracing::info!("Floorcast broadcaster shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
