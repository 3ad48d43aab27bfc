//! Resilient access to a remote document store.
//!
//! [`DataLayer`] owns the shared components and hands out typed
//! [`Gateway`]s; [`monitoring::routes`] exposes health and telemetry over HTTP.

pub mod cache;
pub mod data_layer;
pub mod gateway;
pub mod monitoring;
pub mod observability;
pub mod resilience;

pub use cache::{CacheConfig, CacheError, CacheKey, CacheOperation, CacheStats, TtlCache};
pub use data_layer::{DataLayer, DataLayerConfig, MonitoringSnapshot};
pub use gateway::{ErrorInfo, Gateway, GatewayConfig, OperationResult, ReadOptions};
pub use monitoring::routes;
