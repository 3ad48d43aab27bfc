//! Prometheus export of the data-layer metrics.
//!
//! Components record through the `metrics` facade; this module installs the
//! Prometheus recorder once and serves its rendering.
//!
//! # Example
//!
//! ```rust,ignore
//! use docshield_gateway::observability::metrics::{init_metrics, metrics_handler};
//! use axum::{Router, routing::get};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let app: Router<()> = Router::new().route("/metrics", get(metrics_handler));
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::error;

use crate::cache::CacheStats;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const OPERATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Installs the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), MetricsError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("docshield_operation_duration_seconds".to_string()),
            OPERATION_BUCKETS,
        )
        .map_err(|e| MetricsError::Installation(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Installation("Handle already set".to_string()))?;

    register_metric_descriptions();
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!(
        "docshield_operations_total",
        Unit::Count,
        "Gateway operations by service, operation and outcome"
    );
    describe_histogram!(
        "docshield_operation_duration_seconds",
        Unit::Seconds,
        "Gateway operation duration in seconds"
    );
    describe_counter!(
        "docshield_errors_tracked_total",
        Unit::Count,
        "Error occurrences recorded by the error tracker"
    );
    describe_counter!(
        "docshield_circuit_breaker_transitions_total",
        Unit::Count,
        "Circuit breaker state transitions"
    );
    describe_gauge!(
        "docshield_cache_entries",
        Unit::Count,
        "Entries currently held by the cache"
    );
    describe_gauge!(
        "docshield_cache_hit_ratio",
        "Cache hits over lookups since startup"
    );
}

/// Publishes cache occupancy and hit ratio as gauges.
pub fn record_cache_stats(stats: &CacheStats) {
    gauge!("docshield_cache_entries").set(stats.total_entries as f64);
    gauge!("docshield_cache_hit_ratio").set(stats.hit_rate);
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics exporter: {0}")]
    Installation(String),
}

/// Axum handler rendering the Prometheus text format.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => {
            error!("Metrics handler called but metrics not initialized");
            (StatusCode::INTERNAL_SERVER_ERROR, "Metrics not initialized").into_response()
        }
    }
}
