//! Storage gateway binary entry point
//!
//! Configuration is read from the JSON file named by the first argument or
//! by `STORAGE_GATEWAY_CONFIG`; without either the defaults serve `./data`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::{GatewayServer, StorageService};
use gateway_core::GatewayConfig;

/// Environment variable naming the config file
const CONFIG_ENV: &str = "STORAGE_GATEWAY_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());

    let config = match config_path {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            GatewayConfig::from_json_file(&path)?
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };

    let io = storage::connect(&config.storage).await?;
    let service = StorageService::new(io);

    GatewayServer::with_settings(service, config.server)
        .run()
        .await?;

    Ok(())
}
