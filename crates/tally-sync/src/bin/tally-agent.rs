//! # Tally Sync Agent
//!
//! Headless device process: opens the device store and keeps it in sync
//! with the central store until Ctrl+C.
//!
//! ```text
//! tally-agent [CONFIG_PATH]
//!
//! RUST_LOG=tally_sync=debug tally-agent ./sync.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig};
use tally_sync::{HttpCentralClient, SyncAgent, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(SyncConfig::default_config_path);

    let config = SyncConfig::load(config_path.clone()).context("loading sync config")?;

    // Persist the generated device id so restarts keep the same identity.
    if let Some(path) = &config_path {
        if !path.exists() {
            config
                .save(Some(path.clone()))
                .context("saving generated sync config")?;
            info!(?path, device_id = %config.device_id(), "Wrote initial sync config");
        }
    }

    let db_path = config.database_path().context("resolving database path")?;
    let db = Database::new(DbConfig::new(&db_path))
        .await
        .with_context(|| format!("opening device store at {}", db_path.display()))?;
    db.device()
        .initialize(config.device_id(), config.account_id())
        .await
        .context("initializing device store")?;

    let api = Arc::new(HttpCentralClient::from_config(&config)?);
    let agent = SyncAgent::new(config, db.clone(), api);
    let handle = agent.handle();
    let task = tokio::spawn(agent.run());

    // First cycle right away instead of waiting a full interval.
    handle.sync_now();

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl+C handler")?;
    info!("Shutdown signal received");

    handle.shutdown();
    task.await.context("sync agent task panicked")??;
    db.close().await;

    Ok(())
}
