mod bridge;
mod client;
mod token;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use unblink_protocol::NodeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from the environment
    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Err(issues) = config.validate() {
        for issue in &issues {
            tracing::error!("{}", issue);
        }
        std::process::exit(1);
    }

    std::fs::create_dir_all(&config.app_dir)
        .with_context(|| format!("Failed to create {}", config.app_dir.display()))?;

    let node_id = client::resolve_node_id(&config)?;
    let services = client::load_services(&config.services_path(), &node_id)?;

    tracing::info!("===========================================");
    tracing::info!("  Unblink Node v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Node id: {node_id}");
    tracing::info!("  Services: {}", services.len());
    tracing::info!("===========================================");

    tokio::select! {
        result = client::run(&config, &node_id, &services) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
            Ok(())
        }
    }
}
