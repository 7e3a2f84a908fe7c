#![forbid(unsafe_code)]

mod metrics;
mod room;
mod signaling;

use anyhow::Result;
use metrics::ServerMetrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coderoom=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("coderoom - starting server");

    let metrics = ServerMetrics::new();
    let rooms = Arc::new(RoomRegistry::new(metrics.clone()));
    let server = SignalingServer::new(rooms, metrics);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5001);

    // Run server with graceful shutdown. Room state is in-memory only, so
    // there is nothing to flush on the way out.
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
