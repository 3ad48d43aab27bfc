//! Observability for the data layer: error tracking, health probes,
//! Prometheus export and logging setup.

pub mod error_tracker;
pub mod health;
pub mod logging;
pub mod metrics;

pub use error_tracker::{
    classify_severity, extract_tags, fingerprint, ErrorContext, ErrorFilter, ErrorMetrics,
    ErrorObserver, ErrorSeverity, ErrorTracker, ErrorTrackerConfig, ObserverId, TrackedError,
};

pub use health::{
    classify_performance, classify_usage, BackendHealthCheck, CacheHealthCheck, FnHealthCheck,
    HealthAggregator, HealthCheck, HealthCheckResult, HealthConfig, HealthReport, HealthStatus,
    MemoryHealthCheck, PerformanceHealthCheck,
};

pub use logging::{init_logging, LogConfig, LogFormat};
pub use self::metrics::{init_metrics, metrics_handler, record_cache_stats, MetricsError};
