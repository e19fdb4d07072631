//! Tracing subscriber setup for hosts that embed the store.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::JobStoreError;
use jobstore_config::LoggingConfig;

/// Install a global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), JobStoreError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| JobStoreError::Logging(format!("invalid level {:?}: {}", config.level, e)))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(config.json.then(|| fmt::layer().json().with_target(true)))
        .with((!config.json).then(|| fmt::layer().with_target(true).with_ansi(true)))
        .try_init()
        .map_err(|e| JobStoreError::Logging(e.to_string()))
}
