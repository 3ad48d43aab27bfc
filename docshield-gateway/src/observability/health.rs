//! Aggregated health reporting.
//!
//! Named probes run concurrently, each bounded by a timeout and isolated from
//! panics. The overall status is the worst individual status.
//!
//! Default probes cover the document backend, the cache, recent operation
//! performance and process memory.

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use docshield_core::{DocumentStore, QueryConstraint};
use docshield_metrics::{PerformanceMonitor, PerformanceStats};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TtlCache};

/// Health status of a component or the overall system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but with reduced functionality
    Degraded,
    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Combines two health statuses, returning the worst status
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthCheckResult {
    pub fn healthy(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: HealthStatus::Healthy,
            response_time_ms: 0,
            error: None,
            details: None,
        }
    }

    pub fn degraded(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            error: Some(reason.into()),
            ..Self::healthy(service)
        }
    }

    pub fn unhealthy(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(reason.into()),
            ..Self::healthy(service)
        }
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Combined result of running every registered probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

impl HealthReport {
    pub fn new(checks: BTreeMap<String, HealthCheckResult>) -> Self {
        let status = checks
            .values()
            .fold(HealthStatus::Healthy, |acc, check| acc.combine(&check.status));

        Self {
            status,
            checks,
            timestamp: Utc::now(),
            uptime_seconds: None,
        }
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_seconds = Some(uptime.as_secs());
        self
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let status_code = self.status.http_status();
        (status_code, Json(self)).into_response()
    }
}

/// Trait for implementing health probes.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthCheckResult;

    fn name(&self) -> &str;
}

/// Adapts an async closure into a [`HealthCheck`].
pub struct FnHealthCheck<F> {
    name: String,
    probe: F,
}

impl<F, Fut> FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = HealthCheckResult> + Send,
{
    pub fn new(name: impl Into<String>, probe: F) -> Self {
        Self {
            name: name.into(),
            probe,
        }
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HealthCheckResult> + Send + 'static,
{
    async fn check(&self) -> HealthCheckResult {
        (self.probe)().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Upper bound for any single probe
    #[serde(with = "docshield_core::duration_millis")]
    pub check_timeout: Duration,
    /// Probes that must be present and not unhealthy for readiness
    pub critical_checks: Vec<String>,
    /// Collection queried by the backend probe
    pub probe_collection: String,
    /// Memory budget for the memory probe, defaults to total system memory
    pub memory_limit_bytes: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            critical_checks: vec!["backend".to_string()],
            probe_collection: "_health".to_string(),
            memory_limit_bytes: None,
        }
    }
}

pub struct HealthAggregator {
    config: HealthConfig,
    checks: RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            checks: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Registers `check` under `name`, replacing any previous probe with that name.
    pub async fn register_check(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let name = name.into();
        debug!(check = %name, "Registering health check");
        self.checks.write().await.insert(name, check);
    }

    pub async fn unregister_check(&self, name: &str) -> bool {
        self.checks.write().await.remove(name).is_some()
    }

    pub async fn check_names(&self) -> Vec<String> {
        self.checks.read().await.keys().cloned().collect()
    }

    pub async fn run_all_checks(&self) -> HealthReport {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .read()
            .await
            .iter()
            .map(|(name, check)| (name.clone(), check.clone()))
            .collect();

        HealthReport::new(self.run(checks).await)
    }

    /// Full report with uptime, for external reporting.
    pub async fn get_health_status(&self) -> HealthReport {
        self.run_all_checks()
            .await
            .with_uptime(self.started_at.elapsed())
    }

    /// False if any named check is missing or unhealthy. Only the named
    /// probes are run.
    pub async fn is_ready<S: AsRef<str>>(&self, critical: &[S]) -> bool {
        let (selected, missing) = {
            let registered = self.checks.read().await;
            let mut selected = Vec::new();
            let mut missing = false;
            for name in critical {
                match registered.get(name.as_ref()) {
                    Some(check) => selected.push((name.as_ref().to_string(), check.clone())),
                    None => missing = true,
                }
            }
            (selected, missing)
        };

        if missing {
            return false;
        }

        self.run(selected)
            .await
            .values()
            .all(|result| result.status != HealthStatus::Unhealthy)
    }

    /// Readiness against the configured critical checks.
    pub async fn is_ready_default(&self) -> bool {
        self.is_ready(&self.config.critical_checks).await
    }

    async fn run(
        &self,
        checks: Vec<(String, Arc<dyn HealthCheck>)>,
    ) -> BTreeMap<String, HealthCheckResult> {
        let timeout = self.config.check_timeout;
        let probes = checks.into_iter().map(|(name, check)| async move {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, AssertUnwindSafe(check.check()).catch_unwind())
                    .await;

            let result = match outcome {
                Ok(Ok(mut result)) => {
                    result.service = name.clone();
                    if result.response_time_ms == 0 {
                        result.response_time_ms = started.elapsed().as_millis() as u64;
                    }
                    result
                }
                Ok(Err(_)) => {
                    warn!(check = %name, "Health check panicked");
                    HealthCheckResult::unhealthy(name.clone(), "Health check panicked")
                        .with_response_time(started.elapsed())
                }
                Err(_) => {
                    warn!(check = %name, "Health check timed out");
                    HealthCheckResult::unhealthy(name.clone(), "Health check timed out")
                        .with_response_time(started.elapsed())
                }
            };
            (name, result)
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

/// Bounded query against the document backend.
pub struct BackendHealthCheck {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl BackendHealthCheck {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl HealthCheck for BackendHealthCheck {
    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        match self
            .store
            .query(&self.collection, &[QueryConstraint::limit(1)])
            .await
        {
            Ok(_) => HealthCheckResult::healthy("backend").with_response_time(started.elapsed()),
            Err(e) => {
                warn!("Backend health check failed: {}", e);
                HealthCheckResult::unhealthy("backend", e.to_string())
                    .with_response_time(started.elapsed())
            }
        }
    }

    fn name(&self) -> &str {
        "backend"
    }
}

/// Round-trips a probe entry through the cache.
pub struct CacheHealthCheck {
    cache: TtlCache<CacheKey, Value>,
}

impl CacheHealthCheck {
    pub fn new(cache: TtlCache<CacheKey, Value>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl HealthCheck for CacheHealthCheck {
    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let stats = self.cache.stats();
        let details = json!({
            "entries": stats.total_entries,
            "max_entries": stats.max_entries,
            "hit_rate": stats.hit_rate,
        });

        // A full cache would evict a real entry to make room for the probe.
        if stats.total_entries >= stats.max_entries {
            return HealthCheckResult::healthy("cache")
                .with_response_time(started.elapsed())
                .with_details(details);
        }

        let key = CacheKey::probe(uuid::Uuid::new_v4().simple().to_string());
        let marker = json!({ "probe": key.params });

        self.cache.set_with_ttl(key.clone(), marker.clone(), Duration::from_secs(10));
        let read_back = self.cache.peek(&key);
        self.cache.delete(&key);

        let result = if read_back.as_ref() == Some(&marker) {
            HealthCheckResult::healthy("cache")
        } else {
            HealthCheckResult::unhealthy("cache", "Cache probe value could not be read back")
        };
        result
            .with_response_time(started.elapsed())
            .with_details(details)
    }

    fn name(&self) -> &str {
        "cache"
    }
}

/// Unhealthy above 10% errors; degraded above 5% or 2s average latency.
pub fn classify_performance(stats: &PerformanceStats) -> (HealthStatus, Option<String>) {
    if stats.error_rate > 10.0 {
        (
            HealthStatus::Unhealthy,
            Some(format!("Error rate {:.1}% exceeds 10%", stats.error_rate)),
        )
    } else if stats.error_rate > 5.0 {
        (
            HealthStatus::Degraded,
            Some(format!("Error rate {:.1}% exceeds 5%", stats.error_rate)),
        )
    } else if stats.average_duration_ms > 2000.0 {
        (
            HealthStatus::Degraded,
            Some(format!(
                "Average duration {:.0}ms exceeds 2000ms",
                stats.average_duration_ms
            )),
        )
    } else {
        (HealthStatus::Healthy, None)
    }
}

pub struct PerformanceHealthCheck {
    monitor: Arc<PerformanceMonitor>,
}

impl PerformanceHealthCheck {
    pub fn new(monitor: Arc<PerformanceMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl HealthCheck for PerformanceHealthCheck {
    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let stats = self.monitor.get_stats(None, None).await;
        let details = json!({
            "total_operations": stats.total_operations,
            "error_rate": stats.error_rate,
            "average_duration_ms": stats.average_duration_ms,
            "p95_ms": stats.latency.p95,
        });

        let result = match classify_performance(&stats) {
            (HealthStatus::Healthy, _) => HealthCheckResult::healthy("performance"),
            (HealthStatus::Degraded, reason) => {
                HealthCheckResult::degraded("performance", reason.unwrap_or_default())
            }
            (HealthStatus::Unhealthy, reason) => {
                HealthCheckResult::unhealthy("performance", reason.unwrap_or_default())
            }
        };
        result
            .with_response_time(started.elapsed())
            .with_details(details)
    }

    fn name(&self) -> &str {
        "performance"
    }
}

/// Degraded at 75% of the budget, unhealthy at 90%.
pub fn classify_usage(percent: f64) -> HealthStatus {
    if percent >= 90.0 {
        HealthStatus::Unhealthy
    } else if percent >= 75.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

pub struct MemoryHealthCheck {
    limit_bytes: Option<u64>,
}

impl MemoryHealthCheck {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self { limit_bytes }
    }
}

#[async_trait]
impl HealthCheck for MemoryHealthCheck {
    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let mut system = System::new();
        system.refresh_memory();

        let used = system.used_memory();
        let limit = self
            .limit_bytes
            .filter(|limit| *limit > 0)
            .unwrap_or_else(|| system.total_memory());
        if limit == 0 {
            return HealthCheckResult::degraded("memory", "Memory information unavailable")
                .with_response_time(started.elapsed());
        }

        let percent = used as f64 / limit as f64 * 100.0;
        let details = json!({
            "used_bytes": used,
            "limit_bytes": limit,
            "usage_percent": percent,
        });

        let reason = format!("Memory usage at {:.1}%", percent);
        let result = match classify_usage(percent) {
            HealthStatus::Healthy => HealthCheckResult::healthy("memory"),
            HealthStatus::Degraded => HealthCheckResult::degraded("memory", reason),
            HealthStatus::Unhealthy => HealthCheckResult::unhealthy("memory", reason),
        };
        result
            .with_response_time(started.elapsed())
            .with_details(details)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
