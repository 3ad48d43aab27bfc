//! Error deduplication and classification.
//!
//! Failures are bucketed by a fingerprint of `service:operation:message` so a
//! flapping backend produces one record with a growing occurrence count rather
//! than thousands of rows.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docshield_core::{CallContext, ReportableError, TimeRange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Where and for whom an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub service: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            user_id: None,
            user_role: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_call(mut self, call: &CallContext) -> Self {
        self.user_id = call.user_id.clone();
        self.user_role = call.user_role.clone();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedError {
    /// Same as the fingerprint
    pub id: String,
    pub fingerprint: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub context: ErrorContext,
    pub severity: ErrorSeverity,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub occurrences: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub severity: Option<ErrorSeverity>,
    pub resolved: Option<bool>,
    pub user_id: Option<String>,
    /// Every listed tag must be present
    pub tags: Option<Vec<String>>,
    pub time_range: Option<TimeRange>,
}

impl ErrorFilter {
    fn matches(&self, err: &TrackedError) -> bool {
        self.service.as_ref().map_or(true, |s| &err.context.service == s)
            && self
                .operation
                .as_ref()
                .map_or(true, |o| &err.context.operation == o)
            && self.severity.map_or(true, |s| err.severity == s)
            && self.resolved.map_or(true, |r| err.resolved == r)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| err.context.user_id.as_ref() == Some(u))
            && self
                .tags
                .as_ref()
                .map_or(true, |tags| tags.iter().all(|t| err.tags.contains(t)))
            && self
                .time_range
                .map_or(true, |r| r.contains(err.last_seen_at))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    /// Sum of occurrences in the window
    pub total_errors: u64,
    pub errors_by_service: BTreeMap<String, u64>,
    pub errors_by_operation: BTreeMap<String, u64>,
    pub errors_by_user: BTreeMap<String, u64>,
    pub errors_by_severity: BTreeMap<ErrorSeverity, u64>,
    /// Errors per hour over the window
    pub error_rate: f64,
    pub average_resolution_time_ms: f64,
    pub top_errors: Vec<TrackedError>,
    pub recent_errors: Vec<TrackedError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTrackerConfig {
    pub max_errors: usize,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self { max_errors: 10_000 }
    }
}

pub type ErrorObserver = Arc<dyn Fn(&TrackedError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct ErrorTracker {
    config: ErrorTrackerConfig,
    errors: DashMap<String, TrackedError>,
    observers: DashMap<u64, ErrorObserver>,
    next_observer: AtomicU64,
}

impl ErrorTracker {
    pub fn new(config: ErrorTrackerConfig) -> Self {
        Self {
            config,
            errors: DashMap::new(),
            observers: DashMap::new(),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Records one occurrence of `err` and returns the updated record.
    pub fn track_error<E>(&self, err: &E, context: &ErrorContext) -> TrackedError
    where
        E: ReportableError + ?Sized,
    {
        let message = err.to_string();
        let fingerprint = fingerprint(&context.service, &context.operation, &message);

        let (tracked, inserted) = match self.errors.entry(fingerprint.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.occurrences += 1;
                existing.last_seen_at = context.timestamp.max(existing.last_seen_at);
                existing.context.timestamp = context.timestamp;
                if context.user_id.is_some() {
                    existing.context.user_id = context.user_id.clone();
                }
                if context.user_role.is_some() {
                    existing.context.user_role = context.user_role.clone();
                }
                (existing.clone(), false)
            }
            Entry::Vacant(slot) => {
                let severity = classify_severity(&message, &context.operation);
                let tracked = TrackedError {
                    id: fingerprint.clone(),
                    fingerprint: fingerprint.clone(),
                    tags: extract_tags(&message, context),
                    stack_trace: err.stack_trace(),
                    code: err.code().map(str::to_string),
                    context: context.clone(),
                    severity,
                    resolved: false,
                    resolved_at: None,
                    occurrences: 1,
                    first_seen_at: context.timestamp,
                    last_seen_at: context.timestamp,
                    message,
                };
                slot.insert(tracked.clone());
                (tracked, true)
            }
        };

        if inserted {
            self.enforce_capacity();
        }

        log_tracked(&tracked);
        metrics::counter!(
            "docshield_errors_tracked_total",
            "service" => tracked.context.service.clone(),
            "severity" => tracked.severity.as_str()
        )
        .increment(1);
        self.notify(&tracked);

        tracked
    }

    fn enforce_capacity(&self) {
        let len = self.errors.len();
        if len <= self.config.max_errors {
            return;
        }

        let evict = (len / 10).max(1);
        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .errors
            .iter()
            .map(|e| (e.last_seen_at, e.key().clone()))
            .collect();
        by_age.sort();

        for (_, key) in by_age.into_iter().take(evict) {
            self.errors.remove(&key);
        }
        info!(evicted = evict, "Evicted oldest tracked errors");
    }

    fn notify(&self, tracked: &TrackedError) {
        let observers: Vec<ErrorObserver> =
            self.observers.iter().map(|o| o.value().clone()).collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(tracked))).is_err() {
                warn!(error_id = %tracked.id, "Error observer panicked");
            }
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&TrackedError) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, Arc::new(observer));
        ObserverId(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.remove(&id.0).is_some()
    }

    pub fn get_error(&self, id: &str) -> Option<TrackedError> {
        self.errors.get(id).map(|e| e.value().clone())
    }

    pub fn get_all_errors(&self) -> Vec<TrackedError> {
        self.get_errors_by_filter(&ErrorFilter::default())
    }

    /// Matching errors, most recently seen first.
    pub fn get_errors_by_filter(&self, filter: &ErrorFilter) -> Vec<TrackedError> {
        let mut matched: Vec<TrackedError> = self
            .errors
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matched.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        matched
    }

    pub fn resolve_error(&self, id: &str) -> bool {
        match self.errors.get_mut(id) {
            Some(mut err) => {
                if !err.resolved {
                    err.resolved = true;
                    err.resolved_at = Some(Utc::now());
                    info!(error_id = %id, "Error resolved");
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn clear(&self) {
        self.errors.clear();
    }

    /// Aggregates over errors last seen inside `time_range` (default: last 24 hours).
    pub fn get_metrics(&self, time_range: Option<TimeRange>) -> ErrorMetrics {
        let range = time_range.unwrap_or_else(|| TimeRange::last(chrono::Duration::hours(24)));
        let errors = self.get_errors_by_filter(&ErrorFilter {
            time_range: Some(range),
            ..Default::default()
        });

        let mut metrics = ErrorMetrics::default();
        let mut resolution_ms = Vec::new();

        for err in &errors {
            metrics.total_errors += err.occurrences;
            *metrics
                .errors_by_service
                .entry(err.context.service.clone())
                .or_default() += err.occurrences;
            *metrics
                .errors_by_operation
                .entry(err.context.operation.clone())
                .or_default() += err.occurrences;
            if let Some(ref user) = err.context.user_id {
                *metrics.errors_by_user.entry(user.clone()).or_default() += err.occurrences;
            }
            *metrics.errors_by_severity.entry(err.severity).or_default() += err.occurrences;

            if err.resolved {
                resolution_ms.push((err.last_seen_at - err.first_seen_at).num_milliseconds() as f64);
            }
        }

        metrics.error_rate = metrics.total_errors as f64 / range.hours();
        if !resolution_ms.is_empty() {
            metrics.average_resolution_time_ms =
                resolution_ms.iter().sum::<f64>() / resolution_ms.len() as f64;
        }

        let mut top = errors.clone();
        top.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        top.truncate(10);
        metrics.top_errors = top;

        metrics.recent_errors = errors.into_iter().take(20).collect();
        metrics
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(ErrorTrackerConfig::default())
    }
}

/// First 16 hex chars of SHA-256 over the normalized `service:operation:message`.
pub fn fingerprint(service: &str, operation: &str, message: &str) -> String {
    let raw = format!("{}:{}:{}", service, operation, message);
    let normalized = raw
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

pub fn classify_severity(message: &str, operation: &str) -> ErrorSeverity {
    let message = message.to_lowercase();
    let operation = operation.to_lowercase();

    if ["database", "connection", "timeout"]
        .iter()
        .any(|w| message.contains(w))
    {
        ErrorSeverity::Critical
    } else if ["permission", "unauthorized", "forbidden"]
        .iter()
        .any(|w| message.contains(w))
    {
        ErrorSeverity::High
    } else if ["create", "update", "delete"]
        .iter()
        .any(|w| operation.contains(w))
    {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

const KEYWORD_TAGS: &[(&str, &[&str])] = &[
    ("network", &["network", "connection", "econn", "socket"]),
    ("timeout", &["timeout", "timed out", "deadline"]),
    ("permission", &["permission", "unauthorized", "forbidden"]),
    ("validation", &["validation", "invalid", "required"]),
    ("not-found", &["not found", "not-found"]),
    ("duplicate", &["duplicate", "already exists", "already-exists"]),
];

pub fn extract_tags(message: &str, context: &ErrorContext) -> Vec<String> {
    let lowered = message.to_lowercase();
    let mut tags = vec![
        format!("service:{}", context.service),
        format!("operation:{}", context.operation),
    ];

    for (tag, markers) in KEYWORD_TAGS {
        if markers.iter().any(|m| lowered.contains(m)) {
            tags.push(tag.to_string());
        }
    }

    if let Some(ref role) = context.user_role {
        tags.push(format!("role:{}", role));
    }
    tags
}

fn log_tracked(tracked: &TrackedError) {
    let service = &tracked.context.service;
    let operation = &tracked.context.operation;
    match tracked.severity {
        ErrorSeverity::Critical | ErrorSeverity::High => error!(
            error_id = %tracked.id,
            %service,
            %operation,
            severity = tracked.severity.as_str(),
            occurrences = tracked.occurrences,
            "{}",
            tracked.message
        ),
        ErrorSeverity::Medium => warn!(
            error_id = %tracked.id,
            %service,
            %operation,
            occurrences = tracked.occurrences,
            "{}",
            tracked.message
        ),
        ErrorSeverity::Low => info!(
            error_id = %tracked.id,
            %service,
            %operation,
            occurrences = tracked.occurrences,
            "{}",
            tracked.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docshield_core::StoreError;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn ctx(service: &str, operation: &str) -> ErrorContext {
        ErrorContext::new(service, operation)
    }

    #[test]
    fn fingerprint_is_normalized_and_short() {
        let a = fingerprint("orders", "find_by_id", "Network   Timeout ");
        let b = fingerprint("orders", "find_by_id", "network timeout");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, fingerprint("orders", "find_many", "network timeout"));
    }

    #[test]
    fn repeated_errors_share_one_record() {
        let tracker = ErrorTracker::default();
        let first = tracker.track_error("network timeout", &ctx("orders", "find_by_id"));
        let second = tracker.track_error("network timeout", &ctx("orders", "find_by_id"));

        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrences, 2);
        assert_eq!(tracker.len(), 1);

        tracker.track_error("permission denied", &ctx("orders", "find_by_id"));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn later_context_overwrites_user_fields() {
        let tracker = ErrorTracker::default();
        let call = CallContext::for_user("u-1").with_role("admin");
        tracker.track_error("boom", &ctx("orders", "create").with_call(&call));
        let updated = tracker.track_error(
            "boom",
            &ctx("orders", "create").with_call(&CallContext::for_user("u-2")),
        );

        assert_eq!(updated.context.user_id.as_deref(), Some("u-2"));
        assert_eq!(updated.context.user_role.as_deref(), Some("admin"));
    }

    #[rstest]
    #[case("database connection lost", "find_by_id", ErrorSeverity::Critical)]
    #[case("request timeout", "find_many", ErrorSeverity::Critical)]
    #[case("Forbidden", "find_by_id", ErrorSeverity::High)]
    #[case("name is required", "create", ErrorSeverity::Medium)]
    #[case("name is required", "find_many", ErrorSeverity::Low)]
    fn severity_rules(
        #[case] message: &str,
        #[case] operation: &str,
        #[case] expected: ErrorSeverity,
    ) {
        assert_eq!(classify_severity(message, operation), expected);
    }

    #[test]
    fn tags_include_keywords_and_role() {
        let context = ctx("orders", "create")
            .with_call(&CallContext::for_user("u-1").with_role("admin"));
        let tags = extract_tags("Connection timed out", &context);

        assert_eq!(
            tags,
            vec![
                "service:orders",
                "operation:create",
                "network",
                "timeout",
                "role:admin"
            ]
        );
    }

    #[test]
    fn records_code_from_store_errors() {
        let tracker = ErrorTracker::default();
        let err = StoreError::unavailable("backend down");
        let tracked = tracker.track_error(&err, &ctx("orders", "find_many"));
        assert_eq!(tracked.code.as_deref(), Some("unavailable"));
    }

    #[test]
    fn evicts_oldest_tenth_over_capacity() {
        let tracker = ErrorTracker::new(ErrorTrackerConfig { max_errors: 10 });
        let base = Utc::now() - chrono::Duration::minutes(30);

        for i in 0..11 {
            let mut context = ctx("orders", "find_by_id");
            context.timestamp = base + chrono::Duration::seconds(i);
            tracker.track_error(format!("failure {}", i).as_str(), &context);
        }

        assert_eq!(tracker.len(), 10);
        let messages: Vec<String> = tracker
            .get_all_errors()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(!messages.contains(&"failure 0".to_string()));
        assert_eq!(messages[0], "failure 10");
    }

    #[test]
    fn filters_and_resolution() {
        let tracker = ErrorTracker::default();
        let tracked = tracker.track_error("permission denied", &ctx("orders", "update"));
        tracker.track_error("not found", &ctx("vendors", "find_by_id"));

        let filter = ErrorFilter {
            service: Some("orders".to_string()),
            tags: Some(vec!["permission".to_string()]),
            ..Default::default()
        };
        assert_eq!(tracker.get_errors_by_filter(&filter).len(), 1);

        assert!(tracker.resolve_error(&tracked.id));
        assert!(!tracker.resolve_error("missing"));

        let unresolved = ErrorFilter {
            resolved: Some(false),
            ..Default::default()
        };
        let remaining = tracker.get_errors_by_filter(&unresolved);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].context.service, "vendors");
    }

    #[test]
    fn metrics_sum_occurrences() {
        let tracker = ErrorTracker::default();
        let call = CallContext::for_user("u-1");
        for _ in 0..3 {
            tracker.track_error("network timeout", &ctx("orders", "find_by_id").with_call(&call));
        }
        tracker.track_error("invalid payload", &ctx("vendors", "create"));

        let metrics = tracker.get_metrics(None);
        assert_eq!(metrics.total_errors, 4);
        assert_eq!(metrics.errors_by_service["orders"], 3);
        assert_eq!(metrics.errors_by_user["u-1"], 3);
        assert_eq!(metrics.errors_by_severity[&ErrorSeverity::Critical], 3);
        assert_eq!(metrics.top_errors[0].occurrences, 3);
        assert!((metrics.error_rate - 4.0 / 24.0).abs() < 1e-3);
    }

    #[test]
    fn observer_panics_are_contained() {
        let tracker = ErrorTracker::default();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();

        tracker.subscribe(|_| panic!("observer failure"));
        let id = tracker.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let tracked = tracker.track_error("boom", &ctx("orders", "delete"));
        assert_eq!(tracked.occurrences, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(tracker.unsubscribe(id));
        tracker.track_error("boom", &ctx("orders", "delete"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_occurrences_are_all_counted() {
        for round in 0..50 {
            let tracker = ErrorTracker::default();
            let message = format!("socket closed {}", round);

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    scope.spawn(|| {
                        tracker.track_error(message.as_str(), &ctx("orders", "find_many"));
                    });
                }
            });

            assert_eq!(tracker.len(), 1);
            assert_eq!(tracker.get_all_errors()[0].occurrences, 8);
        }
    }

    #[test]
    fn resolution_time_spans_first_to_last_occurrence() {
        let tracker = ErrorTracker::default();
        let now = Utc::now();

        let mut first = ctx("orders", "update");
        first.timestamp = now - chrono::Duration::hours(2);
        let tracked = tracker.track_error("version conflict", &first);

        let mut again = ctx("orders", "update");
        again.timestamp = now - chrono::Duration::hours(1);
        tracker.track_error("version conflict", &again);

        let mut open = ctx("vendors", "update");
        open.timestamp = now - chrono::Duration::hours(3);
        tracker.track_error("still failing", &open);

        assert_eq!(tracker.get_metrics(None).average_resolution_time_ms, 0.0);

        tracker.resolve_error(&tracked.id);
        let metrics = tracker.get_metrics(None);
        assert_eq!(metrics.average_resolution_time_ms, 3_600_000.0);
    }

    #[test]
    fn metrics_only_count_errors_inside_the_range() {
        let tracker = ErrorTracker::default();
        let now = Utc::now();

        let mut old = ctx("vendors", "delete").with_call(&CallContext::for_user("u-old"));
        old.timestamp = now - chrono::Duration::days(3);
        tracker.track_error("permission denied", &old);

        let mut recent = ctx("orders", "find_by_id");
        recent.timestamp = now - chrono::Duration::minutes(30);
        tracker.track_error("network timeout", &recent);
        tracker.track_error("network timeout", &recent);

        let range = TimeRange::new(now - chrono::Duration::hours(2), now);
        let metrics = tracker.get_metrics(Some(range));

        assert_eq!(metrics.total_errors, 2);
        assert_eq!(
            metrics.errors_by_service,
            BTreeMap::from([("orders".to_string(), 2)])
        );
        assert!(!metrics.errors_by_operation.contains_key("delete"));
        assert!(metrics.errors_by_user.is_empty());
        assert!(!metrics.errors_by_severity.contains_key(&ErrorSeverity::High));
        assert!((metrics.error_rate - 1.0).abs() < 1e-6);
        assert_eq!(metrics.recent_errors.len(), 1);

        let everything = tracker.get_metrics(Some(TimeRange::new(
            now - chrono::Duration::days(7),
            now,
        )));
        assert_eq!(everything.total_errors, 3);
        assert_eq!(everything.errors_by_user["u-old"], 1);
    }
}
