//! Structured logging bootstrap.
//!
//! The engine itself only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to install a subscriber.

use crate::{
    config::{LogFormat, LoggingConfig},
    Error, Result,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install a global subscriber described by `config`.
///
/// `RUST_LOG` wins over `config.level` when set. Returns `Ok(false)` when a global
/// subscriber was already installed, so repeated calls are harmless.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            Error::config(format!("Invalid log level directive '{}': {e}", config.level))
        })?,
    };

    let layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .boxed(),
    };

    let installed = tracing_subscriber::registry().with(layer.with_filter(filter)).try_init().is_ok();
    if installed {
        tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    }
    Ok(installed)
}

/// Install a quiet subscriber for tests; output is captured by the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
