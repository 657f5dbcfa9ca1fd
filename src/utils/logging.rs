//! Structured logging setup on top of `tracing-subscriber`.
//!
//! The library itself only emits `tracing` events. Applications and tests
//! that want to see them call [`init_logging`] once.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global fmt subscriber configured from `config`.
///
/// `RUST_LOG` overrides the configured level. Installing a second subscriber
/// is not an error; the first one stays active.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set to log to a file".to_string())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
        if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        }
    } else if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::debug!(app = %config.app_name, "Logging initialized");
    }
    Ok(())
}
