//! Lifecycle object owning every shared data-layer component.
//!
//! One `DataLayer` is built at startup and handed around behind an `Arc`;
//! gateways created from it share its cache, breakers, tracker and monitor.

use chrono::{DateTime, Utc};
use docshield_core::{DocumentStore, StoreError};
use docshield_metrics::{
    CacheUsageStats, PerformanceConfig, PerformanceMonitor, PerformanceStats, ServiceStats,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheConfig, CacheError, CacheKey, CacheStats, TtlCache};
use crate::gateway::{Gateway, GatewayConfig, GatewayParts};
use crate::observability::error_tracker::{ErrorMetrics, ErrorTracker, ErrorTrackerConfig};
use crate::observability::health::{
    BackendHealthCheck, CacheHealthCheck, HealthAggregator, HealthConfig, MemoryHealthCheck,
    PerformanceHealthCheck,
};
use crate::observability::metrics::record_cache_stats;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, RetryConfig,
    RetryExecutor, RetryOptions,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLayerConfig {
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub errors: ErrorTrackerConfig,
    pub performance: PerformanceConfig,
    pub health: HealthConfig,
    pub gateway: GatewayConfig,
}

/// Everything an operator dashboard polls, collected in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub cache: CacheStats,
    pub cache_usage: CacheUsageStats,
    pub performance: PerformanceStats,
    pub services: BTreeMap<String, ServiceStats>,
    pub errors: ErrorMetrics,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub collected_at: DateTime<Utc>,
}

pub struct DataLayer {
    store: Arc<dyn DocumentStore>,
    cache: TtlCache<CacheKey, Value>,
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<ErrorTracker>,
    monitor: Arc<PerformanceMonitor>,
    retry: Arc<RetryExecutor>,
    retry_options: RetryOptions<StoreError>,
    health: Arc<HealthAggregator>,
    config: DataLayerConfig,
}

impl DataLayer {
    /// Builds the components and registers the default health probes
    /// (`backend`, `cache`, `performance`, `memory`).
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        config: DataLayerConfig,
    ) -> Result<Self, CacheError> {
        config.cache.validate()?;

        let cache = TtlCache::new(config.cache.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let tracker = Arc::new(ErrorTracker::new(config.errors.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        let retry = Arc::new(RetryExecutor::new(breakers.clone(), tracker.clone()));
        let health = Arc::new(HealthAggregator::new(config.health.clone()));

        health
            .register_check(
                "backend",
                Arc::new(BackendHealthCheck::new(
                    store.clone(),
                    config.health.probe_collection.clone(),
                )),
            )
            .await;
        health
            .register_check("cache", Arc::new(CacheHealthCheck::new(cache.clone())))
            .await;
        health
            .register_check(
                "performance",
                Arc::new(PerformanceHealthCheck::new(monitor.clone())),
            )
            .await;
        health
            .register_check(
                "memory",
                Arc::new(MemoryHealthCheck::new(config.health.memory_limit_bytes)),
            )
            .await;

        info!(
            max_entries = config.cache.max_entries,
            failure_threshold = config.circuit_breaker.failure_threshold,
            max_attempts = config.retry.max_attempts,
            "Data layer initialized"
        );

        Ok(Self {
            store,
            cache,
            breakers,
            tracker,
            monitor,
            retry,
            retry_options: RetryOptions::new(config.retry.clone()),
            health,
            config,
        })
    }

    /// Replaces the retry predicate and hook used by gateways created afterwards.
    pub fn with_retry_options(mut self, options: RetryOptions<StoreError>) -> Self {
        self.retry_options = options;
        self
    }

    pub fn gateway<T>(&self, collection: impl Into<String>) -> Gateway<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Gateway::new(
            collection,
            GatewayParts {
                store: self.store.clone(),
                cache: self.cache.clone(),
                monitor: self.monitor.clone(),
                retry: self.retry.clone(),
                tracker: self.tracker.clone(),
                retry_options: self.retry_options.clone(),
                config: self.config.gateway.clone(),
            },
        )
    }

    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn cache(&self) -> &TtlCache<CacheKey, Value> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn retry_executor(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    pub async fn snapshot(&self) -> MonitoringSnapshot {
        let cache = self.cache.stats();
        record_cache_stats(&cache);

        MonitoringSnapshot {
            cache,
            cache_usage: self.monitor.get_cache_stats().await,
            performance: self.monitor.get_stats(None, None).await,
            services: self.monitor.get_service_stats().await,
            errors: self.tracker.get_metrics(None),
            circuit_breakers: self.breakers.snapshots().await,
            collected_at: Utc::now(),
        }
    }

    /// Clears cached data, tracked errors and recorded metrics, and closes
    /// every breaker.
    pub async fn reset(&self) {
        self.cache.clear();
        self.tracker.clear();
        self.monitor.clear().await;
        self.breakers.reset_all().await;
        info!("Data layer state reset");
    }
}
