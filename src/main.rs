use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use invtrack::api::{start_server, AppState, Metrics, RetryConfig, ServerConfig};
use invtrack::contracts::OrderNumberGenerator;
use invtrack::storage::{default_staff, seed_users, RocksDbStorage, StorageConfig};
use invtrack::tracker::{Tracker, TrackerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("invtrack=info".parse()?))
        .init();

    tracing::info!("Investigation tracker starting...");

    let data_dir = std::env::var("INVTRACK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let storage = RocksDbStorage::open_with_config(&data_dir, StorageConfig::from_env())?;
    tracing::info!("Opened RocksDB at {}", data_dir);

    let seed = std::env::var("INVTRACK_SEED_USERS")
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if seed {
        let created = seed_users(&storage, &default_staff())?;
        tracing::info!(created, "Seeded default staff accounts");
    }

    let orders = Arc::new(storage.order_counter());
    tracing::info!(
        current_sequence = orders.current_sequence()?,
        "Order counter ready"
    );

    let tracker = Tracker::new(Arc::new(storage), orders, TrackerConfig::from_env());
    let state = Arc::new(AppState::new(
        tracker,
        Arc::new(Metrics::new()),
        RetryConfig::from_env(),
    ));

    start_server(ServerConfig::from_env(), state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
    })
    .await?;

    Ok(())
}
