//! Performance monitoring for data-access operations.
//!
//! Every measured call lands in a bounded ring buffer; statistics are derived
//! from the buffer on demand. Durations and outcomes are also forwarded to the
//! `metrics` facade so an installed exporter can scrape them.

use chrono::{DateTime, Utc};
use docshield_core::TimeRange;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregators::{LatencyAggregator, LatencySummary};

/// Configuration for the performance monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Maximum number of metrics kept in the ring buffer
    pub capacity: usize,
    /// Operations slower than this are logged
    #[serde(with = "docshield_core::duration_millis")]
    pub slow_threshold: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            slow_threshold: Duration::from_millis(1000),
        }
    }
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub service: String,
    pub operation: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a measured call reports its outcome.
pub trait Outcome {
    fn succeeded(&self) -> bool;

    fn failure_message(&self) -> Option<String>;

    fn cache_hit(&self) -> Option<bool> {
        None
    }
}

impl<T, E: fmt::Display> Outcome for Result<T, E> {
    fn succeeded(&self) -> bool {
        self.is_ok()
    }

    fn failure_message(&self) -> Option<String> {
        self.as_ref().err().map(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_operations: usize,
    pub average_duration_ms: f64,
    pub latency: LatencySummary,
    /// Percentage of successful operations
    pub success_rate: f64,
    /// Percentage of cache hits among operations reporting a cache outcome
    pub cache_hit_rate: f64,
    pub slowest_operations: Vec<PerformanceMetric>,
    /// Percentage of failed operations
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_operations: usize,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub error_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheUsageStats {
    pub hits: usize,
    pub misses: usize,
    pub hit_rate: f64,
}

pub struct PerformanceMonitor {
    config: PerformanceConfig,
    metrics: RwLock<VecDeque<PerformanceMetric>>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            metrics: RwLock::new(VecDeque::with_capacity(config.capacity)),
            config,
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// Times `operation` and records its outcome.
    ///
    /// The result is returned untouched; recording never fails.
    pub async fn measure<F, R>(&self, service: &str, operation: &str, operation_future: F) -> R
    where
        F: Future<Output = R>,
        R: Outcome,
    {
        let started = Instant::now();
        let result = operation_future.await;
        let elapsed = started.elapsed();

        self.record(PerformanceMetric {
            service: service.to_string(),
            operation: operation.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
            success: result.succeeded(),
            cache_hit: result.cache_hit(),
            error: result.failure_message(),
        })
        .await;

        result
    }

    pub async fn record(&self, metric: PerformanceMetric) {
        let outcome = if metric.success { "success" } else { "failure" };
        metrics::counter!(
            "docshield_operations_total",
            "service" => metric.service.clone(),
            "operation" => metric.operation.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "docshield_operation_duration_seconds",
            "service" => metric.service.clone(),
            "operation" => metric.operation.clone()
        )
        .record(metric.duration_ms / 1000.0);

        if metric.duration_ms > self.config.slow_threshold.as_secs_f64() * 1000.0 {
            warn!(
                service = %metric.service,
                operation = %metric.operation,
                duration_ms = metric.duration_ms,
                "Slow operation detected"
            );
        }
        if let Some(ref error) = metric.error {
            warn!(
                service = %metric.service,
                operation = %metric.operation,
                error = %error,
                "Operation failed"
            );
        } else {
            debug!(
                service = %metric.service,
                operation = %metric.operation,
                duration_ms = metric.duration_ms,
                cache_hit = ?metric.cache_hit,
                "Operation completed"
            );
        }

        let mut buffer = self.metrics.write().await;
        while buffer.len() >= self.config.capacity.max(1) {
            buffer.pop_front();
        }
        buffer.push_back(metric);
    }

    pub async fn len(&self) -> usize {
        self.metrics.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.metrics.read().await.is_empty()
    }

    pub async fn get_stats(
        &self,
        service: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> PerformanceStats {
        let buffer = self.metrics.read().await;
        let selected: Vec<&PerformanceMetric> = buffer
            .iter()
            .filter(|m| service.map_or(true, |s| m.service == s))
            .filter(|m| time_range.map_or(true, |r| r.contains(m.timestamp)))
            .collect();

        if selected.is_empty() {
            return PerformanceStats::default();
        }

        let total = selected.len();
        let durations: Vec<f64> = selected.iter().map(|m| m.duration_ms).collect();
        let latency = LatencyAggregator::aggregate(&durations);
        let successes = selected.iter().filter(|m| m.success).count();
        let cache_reported = selected.iter().filter(|m| m.cache_hit.is_some()).count();
        let cache_hits = selected
            .iter()
            .filter(|m| m.cache_hit == Some(true))
            .count();

        let mut slowest: Vec<PerformanceMetric> = selected.iter().map(|m| (*m).clone()).collect();
        slowest.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        slowest.truncate(10);

        PerformanceStats {
            total_operations: total,
            average_duration_ms: latency.mean,
            latency,
            success_rate: LatencyAggregator::rate(successes, total),
            cache_hit_rate: LatencyAggregator::rate(cache_hits, cache_reported),
            slowest_operations: slowest,
            error_rate: LatencyAggregator::rate(total - successes, total),
        }
    }

    /// Most recent failed operations, newest first.
    pub async fn get_recent_errors(&self, limit: usize) -> Vec<PerformanceMetric> {
        self.metrics
            .read()
            .await
            .iter()
            .rev()
            .filter(|m| !m.success)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_operations_by_duration(&self, min_duration_ms: f64) -> Vec<PerformanceMetric> {
        self.metrics
            .read()
            .await
            .iter()
            .filter(|m| m.duration_ms >= min_duration_ms)
            .cloned()
            .collect()
    }

    pub async fn get_service_stats(&self) -> BTreeMap<String, ServiceStats> {
        let buffer = self.metrics.read().await;
        let mut grouped: BTreeMap<String, Vec<&PerformanceMetric>> = BTreeMap::new();
        for metric in buffer.iter() {
            grouped.entry(metric.service.clone()).or_default().push(metric);
        }

        grouped
            .into_iter()
            .map(|(service, metrics)| {
                let total = metrics.len();
                let successes = metrics.iter().filter(|m| m.success).count();
                let duration_sum: f64 = metrics.iter().map(|m| m.duration_ms).sum();
                let stats = ServiceStats {
                    total_operations: total,
                    average_duration_ms: duration_sum / total as f64,
                    success_rate: LatencyAggregator::rate(successes, total),
                    error_count: total - successes,
                };
                (service, stats)
            })
            .collect()
    }

    /// Cache effectiveness over read operations (operation names containing
    /// `find` or `get`).
    pub async fn get_cache_stats(&self) -> CacheUsageStats {
        let buffer = self.metrics.read().await;
        let reads: Vec<&PerformanceMetric> = buffer
            .iter()
            .filter(|m| {
                let op = m.operation.to_ascii_lowercase();
                op.contains("find") || op.contains("get")
            })
            .collect();

        let hits = reads.iter().filter(|m| m.cache_hit == Some(true)).count();
        let misses = reads.len() - hits;

        CacheUsageStats {
            hits,
            misses,
            hit_rate: LatencyAggregator::rate(hits, reads.len()),
        }
    }

    pub async fn clear(&self) {
        self.metrics.write().await.clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}
