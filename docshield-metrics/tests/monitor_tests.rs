use approx::assert_relative_eq;
use chrono::{Duration as ChronoDuration, Utc};
use docshield_core::TimeRange;
use docshield_metrics::{PerformanceConfig, PerformanceMetric, PerformanceMonitor};
use rstest::rstest;
use std::time::Duration;

fn metric(service: &str, operation: &str, duration_ms: f64, success: bool) -> PerformanceMetric {
    PerformanceMetric {
        service: service.to_string(),
        operation: operation.to_string(),
        duration_ms,
        timestamp: Utc::now(),
        success,
        cache_hit: None,
        error: (!success).then(|| "backend unavailable".to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn measure_times_the_wrapped_future() {
    let monitor = PerformanceMonitor::default();

    let value = monitor
        .measure("orders", "find_many", async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok::<_, String>(3)
        })
        .await;

    assert_eq!(value, Ok(3));
    let stats = monitor.get_stats(None, None).await;
    assert_eq!(stats.total_operations, 1);
    assert_relative_eq!(stats.average_duration_ms, 250.0, epsilon = 1.0);
}

#[tokio::test]
async fn failures_keep_their_message() {
    let monitor = PerformanceMonitor::default();

    let _ = monitor
        .measure("orders", "create", async { Err::<(), _>("quota exceeded") })
        .await;

    let errors = monitor.get_recent_errors(5).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.as_deref(), Some("quota exceeded"));
}

#[rstest]
#[case(Some("orders"), 3, 66.666)]
#[case(Some("vendors"), 1, 100.0)]
#[case(None, 4, 75.0)]
#[tokio::test]
async fn stats_scope_by_service(
    #[case] service: Option<&str>,
    #[case] total: usize,
    #[case] success_rate: f64,
) {
    let monitor = PerformanceMonitor::default();
    monitor.record(metric("orders", "find_by_id", 10.0, true)).await;
    monitor.record(metric("orders", "find_by_id", 30.0, true)).await;
    monitor.record(metric("orders", "update", 50.0, false)).await;
    monitor.record(metric("vendors", "find_many", 5.0, true)).await;

    let stats = monitor.get_stats(service, None).await;

    assert_eq!(stats.total_operations, total);
    assert_relative_eq!(stats.success_rate, success_rate, epsilon = 0.01);
}

#[tokio::test]
async fn time_range_excludes_old_metrics() {
    let monitor = PerformanceMonitor::default();
    let mut old = metric("orders", "find_many", 10.0, true);
    old.timestamp = Utc::now() - ChronoDuration::hours(3);
    monitor.record(old).await;
    monitor.record(metric("orders", "find_many", 20.0, true)).await;

    let stats = monitor
        .get_stats(None, Some(TimeRange::last(ChronoDuration::hours(1))))
        .await;

    assert_eq!(stats.total_operations, 1);
    assert_relative_eq!(stats.average_duration_ms, 20.0);
}

#[tokio::test]
async fn buffer_drops_oldest_beyond_capacity() {
    let monitor = PerformanceMonitor::new(PerformanceConfig {
        capacity: 3,
        ..Default::default()
    });

    for duration in [1.0, 2.0, 3.0, 4.0, 5.0] {
        monitor.record(metric("orders", "find_many", duration, true)).await;
    }

    assert_eq!(monitor.len().await, 3);
    let slow = monitor.get_operations_by_duration(0.0).await;
    let mut durations: Vec<f64> = slow.iter().map(|m| m.duration_ms).collect();
    durations.sort_by(f64::total_cmp);
    assert_eq!(durations, vec![3.0, 4.0, 5.0]);
}

#[tokio::test]
async fn service_breakdown_counts_errors() {
    let monitor = PerformanceMonitor::default();
    monitor.record(metric("orders", "find_by_id", 10.0, true)).await;
    monitor.record(metric("orders", "update", 40.0, false)).await;
    monitor.record(metric("vendors", "find_many", 6.0, true)).await;

    let services = monitor.get_service_stats().await;

    assert_eq!(services.len(), 2);
    assert_eq!(services["orders"].total_operations, 2);
    assert_eq!(services["orders"].error_count, 1);
    assert_relative_eq!(services["orders"].average_duration_ms, 25.0);
    assert_relative_eq!(services["vendors"].success_rate, 100.0);
}
