//! rtbridge node.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtbridge_server::{postgres, Args, Bridge, StaticSchemaCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtbridge_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting rtbridge node");

    let args = Args::parse();
    let config = args.into_config();
    config.validate()?;

    tracing::info!(
        heartbeat_interval = ?config.heartbeat_interval,
        channel_ttl = ?config.channel_ttl,
        strict_routing = config.strict_routing,
        "configuration loaded"
    );

    let pool = postgres::connect(&config).await?;
    let (bus, store) = postgres::backend(pool, &config);
    let schema = Arc::new(StaticSchemaCache::new());

    let bridge = Bridge::new(config, Arc::new(bus), Arc::new(store), schema)?;
    let mut handle = bridge.start().await?;
    tracing::info!(channel = %bridge.channel_id(), "node ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for ctrl+c");
            }
            tracing::info!("received shutdown signal");
        }
        result = handle.wait() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "bridge stopped on fatal error");
                std::process::exit(1);
            }
        }
    }

    handle.shutdown().await?;
    tracing::info!("node shutdown complete");
    Ok(())
}
