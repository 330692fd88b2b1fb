//! Engine server binary.
//!
//! Reads configuration from the environment, opens the store, and idles
//! until interrupted. Channels are deployed by the embedding application
//! through the library API; the binary exists for operational smoke runs.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use interchange::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env().context("failed to load configuration")?;
    let engine = Engine::new(config)
        .await
        .context("failed to start engine")?;

    info!("engine running, waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    engine.shutdown().await;
    Ok(())
}
