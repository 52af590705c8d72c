use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use farm_proto::{DeviceOs, ProviderData};
use farm_provider::config::{Cli, ProviderConfig};
use farm_provider::heartbeat::HeartbeatPublisher;
use farm_provider::platform::android::AndroidBackend;
use farm_provider::platform::ios::IosBackend;
use farm_provider::platform::PlatformBackend;
use farm_provider::ports::PortAllocator;
use farm_provider::routes::{build_router, AppState};
use farm_provider::supervisor::{Supervisor, SupervisorOptions};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ProviderConfig::from_cli(Cli::parse())?;
    farm_provider::logging::init(config.log_level, &config.log_file())
        .context("install logging")?;

    let store = farm_store::build_store(config.store_url.as_deref()).await;
    if config.store_url.is_some() {
        match store.devices_for_provider(&config.nickname).await {
            Ok(stored) => config.settings.merge_stored(stored),
            Err(err) => warn!(error = %err, "could not load stored devices"),
        }
    }

    let mut provider = ProviderData::new(&config.nickname, &config.host_address, config.port);
    provider.provide_android = config.settings.provides(DeviceOs::Android);
    provider.provide_ios = config.settings.provides(DeviceOs::Ios);
    provider.use_selenium_grid = config.settings.grid_url().is_some();
    provider.last_updated = farm_proto::now_millis();
    if let Err(err) = store.upsert_provider(&provider).await {
        warn!(error = %err, "could not record provider");
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .context("build http client")?;

    let mut backends: Vec<Arc<dyn PlatformBackend>> = Vec::new();
    if config.settings.provides(DeviceOs::Android) {
        backends.push(Arc::new(AndroidBackend::new(&config)));
    }
    if config.settings.provides(DeviceOs::Ios) {
        backends.push(Arc::new(IosBackend::new(&config, http.clone())));
    }
    if backends.is_empty() {
        warn!("neither provide_android nor provide_ios is set; no devices will be supervised");
    }

    let supervisor = Supervisor::new(
        provider,
        config.settings.devices.clone(),
        config.settings.stream,
        backends,
        Arc::new(PortAllocator::new()),
        http.clone(),
        config.folder.clone(),
        SupervisorOptions::default(),
    );

    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::spawn(supervisor.clone().run(shutdown.clone()));

    let heartbeat = HeartbeatPublisher::new(http, &config.hub_url);
    let snapshot_source = supervisor.clone();
    let heartbeat_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = heartbeat
            .run(move || snapshot_source.provider_update(), heartbeat_shutdown)
            .await;
        if let Err(err) = result {
            error!(error = %err, "lost the hub, exiting");
            std::process::exit(1);
        }
    });

    let app = build_router(AppState {
        supervisor,
        mjpeg_max_frame: config.settings.mjpeg_max_frame_bytes,
    });
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    info!(
        %addr,
        nickname = %config.nickname,
        hub = %config.hub_url,
        devices = config.settings.devices.len(),
        "starting farm-provider"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    shutdown.cancel();
    if let Err(err) = supervisor_task.await {
        warn!(error = %err, "supervisor task ended abnormally");
    }
    info!("farm-provider stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
