use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use farm_hub::auth::AuthKeys;
use farm_hub::config::{Cli, HubConfig};
use farm_hub::janitor::spawn_janitor;
use farm_hub::persist::{seed_registry, spawn_snapshotter};
use farm_hub::registry::Registry;
use farm_hub::routes::build_router;
use farm_hub::state::AppState;
use farm_hub::telemetry::init_tracing;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::try_from(Cli::parse())?;
    init_tracing(&config.log_filter).context("install tracing subscriber")?;

    let store = farm_store::build_store(config.store_url.as_deref()).await;
    let registry = Arc::new(Registry::new());
    if let Err(err) = seed_registry(&registry, store.as_ref()).await {
        warn!(error = %err, "could not seed registry; starting empty");
    }

    let auth = config
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(AuthKeys::hs256(secret)));
    let state = AppState::new(registry.clone(), store.clone(), config.grid, auth);

    let _janitor = spawn_janitor(registry.clone(), config.grid.janitor_period);
    let _snapshotter = spawn_snapshotter(registry, store, config.grid.snapshot_period);

    let app = build_router(state, config.ui_files_dir.clone());
    info!(
        addr = %config.listen_addr,
        auth = config.jwt_secret.is_some(),
        store = %config.store_url.as_deref().unwrap_or("memory"),
        ui = ?config.ui_files_dir,
        "starting farm-hub"
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;
    info!("farm-hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
