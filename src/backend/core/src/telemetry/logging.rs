//! Structured Logging with JSON/Pretty Formats.
//!
//! This module initializes the global `tracing` subscriber:
//!
//! - JSON format for production environments
//! - Pretty format for development
//! - Compact single-line format for dense terminals
//! - Level selection via config, overridable with `RUST_LOG`

use serde::Deserialize;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::ObservabilityConfig;
use crate::error::{DredgeError, ErrorCode, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Initialize the global logging subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so individual runs
/// can be made noisier without touching configuration.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };

    result.map_err(|e| {
        DredgeError::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to initialize logging",
            e.to_string(),
        )
    })
}
