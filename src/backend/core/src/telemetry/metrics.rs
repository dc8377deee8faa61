//! Prometheus Metrics for Dispatch Activity, Workers, and Errors.
//!
//! This module registers the metrics emitted by the worker manager and the
//! error type, and optionally installs a Prometheus exporter:
//!
//! - Dispatch counters (jobs dispatched, claim races)
//! - Running-worker gauge
//! - Error counters by code/category/severity

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::config::ObservabilityConfig;
use crate::error::{DredgeError, ErrorCode, Result};

/// Initialize the metrics subsystem.
///
/// When `metrics_endpoint` is configured, a Prometheus exporter is installed
/// and served on that address. Without it, metric macros record into the
/// no-op default and only the descriptions are registered.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if let Some(endpoint) = &config.metrics_endpoint {
        let addr: SocketAddr = endpoint.parse().map_err(|_| {
            DredgeError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid metrics endpoint",
                format!("could not parse listen address: {}", endpoint),
            )
        })?;

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| {
                DredgeError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to install Prometheus exporter",
                    e.to_string(),
                )
            })?;

        tracing::info!(endpoint = %addr, "Metrics exporter listening");
    }

    register_metric_descriptions();
    Ok(())
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Dispatch metrics
    describe_counter!(
        "dredge_jobs_dispatched_total",
        "Total number of jobs claimed and handed to a worker"
    );
    describe_counter!(
        "dredge_claim_races_total",
        "Total number of claim attempts lost to a concurrent claimer"
    );

    // Worker metrics
    describe_gauge!(
        "dredge_workers_running",
        "Number of currently live workers across all job types"
    );

    // Error metrics
    describe_counter!(
        "dredge_errors_total",
        "Total number of errors by code, category and severity"
    );
}
