//! Tracing subscriber setup.

use parley_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::errors::ServerError;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
fn env_filter(settings: &LoggingSettings) -> Result<EnvFilter, ServerError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| ServerError::Telemetry(format!("invalid log level {:?}: {e}", settings.level))),
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), ServerError> {
    let filter = env_filter(settings)?;

    let json_layer = settings.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let pretty_layer = (!settings.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| ServerError::Telemetry(e.to_string()))
}
