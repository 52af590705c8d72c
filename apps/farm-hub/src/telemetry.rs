use tracing::warn;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Installs the global subscriber. An unparsable filter is reported and replaced by `info`.
pub fn init_tracing(filter: &str) -> Result<(), TryInitError> {
    let (env_filter, rejected) = match EnvFilter::try_new(filter) {
        Ok(parsed) => (parsed, None),
        Err(err) => (EnvFilter::new("info"), Some(err)),
    };
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;
    if let Some(err) = rejected {
        warn!(filter, error = %err, "invalid log filter; using info");
    }
    Ok(())
}
