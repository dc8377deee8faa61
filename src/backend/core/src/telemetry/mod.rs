//! Telemetry: Logging and Metrics Infrastructure.
//!
//! This module provides the observability stack for the Dredge backend:
//!
//! - **Logging**: Structured JSON/pretty logging via `tracing`
//! - **Metrics**: Prometheus metrics for dispatch activity and errors
//!
//! # Example
//!
//! ```rust,no_run
//! use dredge_core::config::ObservabilityConfig;
//! use dredge_core::telemetry;
//!
//! let config = ObservabilityConfig::default();
//! telemetry::init(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::init_metrics;

use crate::config::ObservabilityConfig;
use crate::error::Result;

/// Initialize the full telemetry stack (logging, then metrics).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    init_logging(config)?;
    init_metrics(config)?;
    Ok(())
}
