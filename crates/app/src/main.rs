mod forward;
mod maintenance;
mod problem;
mod router;
mod telemetry;
mod webhook;

use std::net::SocketAddr;

use payhook_storage::Database;
use payhook_util::{load_env_file, AppConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    if config.gateways.is_empty() {
        warn!(
            stage = "app",
            "no gateway secrets configured; every webhook route will answer 404"
        );
    }
    for settings in config.gateways.values() {
        info!(
            stage = "app",
            gateway = %settings.gateway,
            strategy = settings.strategy.label(),
            failure_policy = settings.failure_policy.as_str(),
            reject_unknown_events = settings.reject_unknown_events,
            "gateway enabled"
        );
    }

    let registry = forward::build_registry(config.forward_url.clone())?;
    let log_retention = config
        .gateways
        .values()
        .map(|settings| settings.dedup_retention)
        .max()
        .unwrap_or(payhook_core::DEFAULT_DEDUP_RETENTION);
    maintenance::MaintenanceWorker::new(
        database.clone(),
        config.maintenance_interval,
        log_retention,
    )
    .spawn();

    let state = router::AppState::new(metrics, database, registry, config.gateways.clone());

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
