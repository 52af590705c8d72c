//! Provider logging: one process log plus a pair of files per device.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const FILTER_ENV: &str = "FARM_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// Directive string; below info only our crates get chatty.
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "info,farm_provider=debug,farm_store=debug",
            LogLevel::Trace => "info,farm_provider=trace,farm_store=trace,hyper=info,reqwest=info",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Logs to stderr and, through a non-blocking writer, to `log_file`.
/// `FARM_LOG_FILTER` overrides the level-derived filter.
pub fn init(level: LogLevel, log_file: &Path) -> Result<(), InitError> {
    let file = open_append(log_file)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = match std::env::var(FILTER_ENV) {
        Ok(raw) if !raw.trim().is_empty() => EnvFilter::new(raw),
        _ => EnvFilter::new(level.directive()),
    };

    Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(level >= LogLevel::Debug)
                .with_writer(std::io::stderr),
        )
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn open_append(path: &Path) -> Result<fs::File, InitError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| InitError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Per-device sinks: `device.log` for supervisor and tool output,
/// `appium.log` for the automation server. Writers flush when the last clone
/// of the owning `DeviceLogs` is dropped.
pub struct DeviceLogs {
    pub device: NonBlocking,
    pub appium: NonBlocking,
    _guards: [WorkerGuard; 2],
}

impl DeviceLogs {
    pub fn open(dir: &Path) -> Result<Self, InitError> {
        let (device, device_guard) = tracing_appender::non_blocking(open_append(&dir.join("device.log"))?);
        let (appium, appium_guard) = tracing_appender::non_blocking(open_append(&dir.join("appium.log"))?);
        Ok(Self {
            device,
            appium,
            _guards: [device_guard, appium_guard],
        })
    }
}

/// Appends one timestamped line to a device log writer.
pub fn write_line(writer: &NonBlocking, source: &str, line: &str) {
    use std::io::Write as _;
    let stamp = millis_stamp();
    let mut writer = writer.clone();
    let _ = writeln!(writer, "{stamp} [{source}] {line}");
}

fn millis_stamp() -> String {
    let millis = farm_proto::now_millis();
    format!("{}.{:03}", millis / 1000, millis % 1000)
}
