//! PISA Watchtower service

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pisa_tower::{Tower, TowerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pisa_tower=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "PISA watchtower starting"
    );

    // Load configuration
    let config = TowerConfig::from_env()?;

    info!(
        rpc = %config.json_rpc_url,
        host = %config.host_name,
        port = config.host_port,
        contract = %config.tower_contract_address,
        confirmations = config.watcher_response_confirmations,
        "Configuration loaded"
    );

    // Connect, recover persisted appointments, then start serving
    let tower = Tower::bootstrap(config).await?;
    info!(receipt_key = %tower.receipt_address(), "tower ready");

    let api_tower = tower.clone();
    let api = tokio::spawn(async move { pisa_tower::api::serve(api_tower).await });

    // Handle shutdown gracefully
    tokio::select! {
        result = tower.run() => {
            result?;
        }
        result = api => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Watchtower stopped");
    Ok(())
}
