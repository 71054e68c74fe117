//! Logging initialization
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be made verbose without touching the config file.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{NetfixError, Result};

/// Build the level filter: `RUST_LOG` if set and valid, else the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true);

    let result = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| NetfixError::Config(format!("failed to install log subscriber: {e}")))
}
