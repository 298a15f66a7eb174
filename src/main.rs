use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use arena_core_server::config::ServerConfig;
use arena_core_server::metrics::Metrics;
use arena_core_server::net::session::ArenaSession;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Arena Core Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {} Hz, arena {}x{}, {} hostiles per wave, keyframe every {} ticks, {:?} wire format",
        config.tick_rate,
        config.arena_width,
        config.arena_height,
        config.hostile_count,
        config.replication.keyframe_interval,
        config.replication.wire_format
    );
    if let Some(port) = config.metrics_port {
        info!("Metrics endpoint on port {}", port);
    }

    let metrics = Arc::new(Metrics::new());
    let session = Arc::new(ArenaSession::new(config, metrics));
    session.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    session.shutdown();
    info!("Server stopped");
    Ok(())
}
