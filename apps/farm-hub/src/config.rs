use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "farm-hub",
    author,
    version,
    about = "Device farm hub: WebDriver session dispatcher and device registry"
)]
pub struct Cli {
    /// Port the hub listens on.
    #[arg(long, env = "FARM_HUB_PORT")]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, env = "FARM_HUB_HOST_ADDRESS", default_value = "0.0.0.0")]
    pub host_address: String,

    /// Record store URL (`redis://…`); in-memory records when unset.
    #[arg(long = "store-url", alias = "mongo-db", env = "FARM_HUB_STORE_URL")]
    pub store_url: Option<String>,

    /// Require a bearer JWT on client-facing routes.
    #[arg(long, env = "FARM_HUB_AUTH", default_value_t = false)]
    pub auth: bool,

    /// HS256 secret used to validate bearer tokens when `--auth` is on.
    #[arg(long, env = "FARM_HUB_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Directory of pre-built UI assets served at `/`.
    #[arg(long, env = "FARM_HUB_UI_FILES_DIR")]
    pub ui_files_dir: Option<PathBuf>,

    /// Tracing filter directive, e.g. `info,farm_hub=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    pub store_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub ui_files_dir: Option<PathBuf>,
    pub log_filter: String,
    pub grid: GridSettings,
}

impl TryFrom<Cli> for HubConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let raw = format!("{}:{}", cli.host_address, cli.port);
        let listen_addr: SocketAddr = raw
            .parse()
            .with_context(|| format!("invalid listen address: {raw}"))?;
        let jwt_secret = match (cli.auth, cli.jwt_secret) {
            (true, Some(secret)) if !secret.is_empty() => Some(secret),
            (true, _) => bail!("--auth requires --jwt-secret (or FARM_HUB_JWT_SECRET)"),
            (false, _) => None,
        };
        if let Some(dir) = &cli.ui_files_dir {
            if !dir.is_dir() {
                bail!("ui files directory {} does not exist", dir.display());
            }
        }
        Ok(HubConfig {
            listen_addr,
            store_url: cli.store_url,
            jwt_secret,
            ui_files_dir: cli.ui_files_dir,
            log_filter: cli.log_filter,
            grid: GridSettings::default(),
        })
    }
}

/// Timing knobs for selection and lease handling.
#[derive(Debug, Clone, Copy)]
pub struct GridSettings {
    /// Devices heard from longer ago than this are not selectable.
    pub freshness_ms: i64,
    pub selection_wait: Duration,
    pub selection_poll: Duration,
    pub default_idle_timeout_ms: i64,
    pub janitor_period: Duration,
    pub delete_grace: Duration,
    pub snapshot_period: Duration,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            freshness_ms: 3_000,
            selection_wait: Duration::from_secs(60),
            selection_poll: Duration::from_millis(100),
            default_idle_timeout_ms: 60_000,
            janitor_period: Duration::from_secs(3),
            delete_grace: Duration::from_secs(10),
            snapshot_period: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_flags_and_mongo_alias() {
        let cli = Cli::try_parse_from([
            "farm-hub",
            "--port",
            "4444",
            "--mongo-db",
            "redis://127.0.0.1:6379",
        ])
        .unwrap();
        let config = HubConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:4444".parse().unwrap());
        assert_eq!(config.store_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert!(config.jwt_secret.is_none());
    }

    #[test_timeout::timeout]
    fn auth_without_secret_is_rejected() {
        let cli = Cli::try_parse_from(["farm-hub", "--port", "4444", "--auth"]).unwrap();
        let err = HubConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("--jwt-secret"));
    }

    #[test_timeout::timeout]
    fn port_is_required() {
        assert!(Cli::try_parse_from(["farm-hub"]).is_err());
    }
}
