//! Floorcast relay binary
//!
//! Terminates relay connections from broadcasters and publishes each one to
//! the RTMP URL named in its control frame.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floorcast::{config::Config, publish::ffmpeg::FfmpegWorkerFactory, relay::RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Floorcast relay...");

    let config_path = std::env::var("FLOORCAST_CONFIG").ok();
    let config = Config::load(config_path.as_deref())?;

    tracing::info!(
        "Configuration: relay port={}, queue capacity={}, ffmpeg={}",
        config.server.relay_port,
        config.publish.queue_capacity,
        config.publish.ffmpeg_path
    );

    let factory = Arc::new(FfmpegWorkerFactory::new(config.publish.clone()));
    let server = RelayServer::new(factory);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();

    let bind_addr = format!("{}:{}", config.server.host, config.server.relay_port);
    let listener = TcpListener::bind(&bind_addr).await?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(listener, shutdown_rx).await {
            tracing::error!("Relay server error: {}", e);
        }
    });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    tracing::info!("Floorcast relay shutdown complete");
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
