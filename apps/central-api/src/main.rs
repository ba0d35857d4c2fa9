//! # Tally Central API
//!
//! ```text
//! central-api                                       serve HTTP
//! central-api register-device ACCOUNT DEVICE [NAME] register, print token
//! central-api retire-device DEVICE                  refuse further syncs
//! ```
//!
//! ```text
//! Device ───► HTTP (8080) ───► routes ───► CentralStore ───► SQLite
//! ```

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use central_api::{app_router, AppState, CentralConfig, CentralStore, Database, JwtManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .with_target(true)
        .init();

    let config = CentralConfig::load().context("loading configuration")?;
    info!(
        bind_addr = %config.bind_addr,
        db_url = %config.database_url.chars().take(30).collect::<String>(),
        "Configuration loaded"
    );

    let db = Database::connect(&config.database_url)
        .await
        .context("opening central database")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None => serve(config, db.clone()).await,
        Some("register-device") => register_device(&config, &db, &args[1..]).await,
        Some("retire-device") => retire_device(&db, &args[1..]).await,
        Some(other) => Err(anyhow::anyhow!("unknown command {other}")),
    };

    db.close().await;
    result
}

async fn serve(config: CentralConfig, db: Database) -> anyhow::Result<()> {
    let authenticator = Arc::new(JwtManager::new(
        config.jwt_secret.clone(),
        config.jwt_lifetime_secs,
    ));
    let state = AppState::new(CentralStore::new(db, &config), authenticator);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Starting HTTP server");

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn register_device(
    config: &CentralConfig,
    db: &Database,
    args: &[String],
) -> anyhow::Result<()> {
    let (account_id, device_id) = match args {
        [account, device, ..] => (account.as_str(), device.as_str()),
        _ => bail!("usage: central-api register-device ACCOUNT DEVICE [NAME]"),
    };
    let name = args.get(2).map_or(device_id, String::as_str);

    db.create_account(account_id, account_id).await?;
    let device = db.register_device(account_id, device_id, name).await?;

    let jwt = JwtManager::new(config.jwt_secret.clone(), config.jwt_lifetime_secs);
    let token = jwt.issue_token(&device.account_id, &device.device_id)?;
    println!("{token}");
    Ok(())
}

async fn retire_device(db: &Database, args: &[String]) -> anyhow::Result<()> {
    let Some(device_id) = args.first() else {
        bail!("usage: central-api retire-device DEVICE");
    };
    db.retire_device(device_id).await?;
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
