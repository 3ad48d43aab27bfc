//! Circuit breaker guarding calls to the document backend.
//!
//! A circuit breaker monitors for failures and temporarily blocks requests when
//! failures exceed a threshold, allowing the backend time to recover.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Too many failures detected, requests are rejected
//! - **HalfOpen**: Testing if the backend has recovered
//!
//! # Example
//!
//! ```no_run
//! use docshield_gateway::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("orders:find_by_id", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await {
//!     Ok(result) => println!("Success: {}", result),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! # }
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Too many failures, requests are rejected
    Open,
    /// Testing if the backend has recovered
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Time to wait before transitioning from open to half-open
    #[serde(with = "docshield_core::duration_millis")]
    pub reset_timeout: Duration,
    /// Successes in half-open state required to close circuit
    pub required_successes: usize,
    /// Concurrent probes admitted in half-open state
    pub half_open_max_in_flight: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            required_successes: 3,
            half_open_max_in_flight: 1,
        }
    }
}

/// Circuit breaker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open for {name}")]
    Open { name: String },

    /// Request rejected (too many in-flight probes in half-open state)
    #[error("Circuit breaker rejected request for {name}")]
    Rejected { name: String },

    /// Execution failed with underlying error
    #[error("Execution failed: {0}")]
    ExecutionFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was refused without invoking the operation.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitBreakerError::ExecutionFailed(_))
    }
}

#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    failures: AtomicU64,
    successes: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_opened(&self) {
        self.opened_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.closed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Internal state of the circuit breaker
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    half_open_successes: usize,
    last_failure_time: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_time: None,
        }
    }
}

/// Releases a half-open probe slot when the admitted call finishes or is dropped.
struct ProbePermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    half_open_in_flight: Arc<AtomicUsize>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!("Creating circuit breaker: {}", name);

        Self {
            name,
            config,
            state: RwLock::new(CircuitBreakerState::new()),
            half_open_in_flight: Arc::new(AtomicUsize::new(0)),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Lifetime counters
    pub fn metrics(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            opened_count: self.metrics.opened_count.load(Ordering::Relaxed),
            closed_count: self.metrics.closed_count.load(Ordering::Relaxed),
            rejected_count: self.metrics.rejected_count.load(Ordering::Relaxed),
        }
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.read().await;
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_successes: state.half_open_successes,
            last_failure_ms_ago: state
                .last_failure_time
                .map(|at| at.elapsed().as_millis() as u64),
            stats: self.metrics(),
        }
    }

    /// Call a function with circuit breaker protection.
    ///
    /// When the circuit is open and the reset timeout has not elapsed, `f` is
    /// never invoked.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.before_call().await?;

        let outcome = f().await;
        match outcome {
            Ok(result) => {
                self.on_success().await;
                drop(permit);
                Ok(result)
            }
            Err(e) => {
                self.on_error().await;
                drop(permit);
                Err(CircuitBreakerError::ExecutionFailed(e))
            }
        }
    }

    async fn before_call<E>(&self) -> Result<Option<ProbePermit>, CircuitBreakerError<E>> {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);

                if cooled_down {
                    info!("Circuit breaker {} transitioning to half-open", self.name);
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    self.half_open_in_flight.store(0, Ordering::Release);
                    record_transition(&self.name, CircuitState::HalfOpen);
                    self.try_admit_probe()
                } else {
                    self.metrics.record_rejected();
                    Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => self.try_admit_probe(),
        }
    }

    fn try_admit_probe<E>(&self) -> Result<Option<ProbePermit>, CircuitBreakerError<E>> {
        let max = self.config.half_open_max_in_flight.max(1);
        let admitted = self
            .half_open_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();

        if admitted {
            Ok(Some(ProbePermit {
                in_flight: self.half_open_in_flight.clone(),
            }))
        } else {
            self.metrics.record_rejected();
            Err(CircuitBreakerError::Rejected {
                name: self.name.clone(),
            })
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        self.metrics.record_success();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;

                if state.half_open_successes >= self.config.required_successes {
                    info!(
                        "Circuit breaker {} closing after {} successes",
                        self.name, state.half_open_successes
                    );
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.half_open_successes = 0;
                    self.metrics.record_closed();
                    record_transition(&self.name, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit re-opened.
            CircuitState::Open => {}
        }
    }

    async fn on_error(&self) {
        let mut state = self.state.write().await;
        self.metrics.record_failure();

        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker {} opening after {} failures",
                        self.name, state.consecutive_failures
                    );
                    state.state = CircuitState::Open;
                    self.metrics.record_opened();
                    record_transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker {} re-opening due to failure in half-open state",
                    self.name
                );
                state.state = CircuitState::Open;
                state.half_open_successes = 0;
                self.metrics.record_opened();
                record_transition(&self.name, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!("Manually resetting circuit breaker: {}", self.name);
        *state = CircuitBreakerState::new();
        self.half_open_in_flight.store(0, Ordering::Release);
    }
}

fn record_transition(name: &str, to: CircuitState) {
    metrics::counter!(
        "docshield_circuit_breaker_transitions_total",
        "breaker" => name.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub failures: u64,
    pub successes: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub rejected_count: u64,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub half_open_successes: usize,
    pub last_failure_ms_ago: Option<u64>,
    pub stats: CircuitBreakerStats,
}

/// Lazily created breakers, one per `service:operation`.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn key(service: &str, operation: &str) -> String {
        format!("{}:{}", service, operation)
    }

    pub fn get_or_create(&self, service: &str, operation: &str) -> Arc<CircuitBreaker> {
        let key = Self::key(service, operation);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    pub fn get(&self, service: &str, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&Self::key(service, operation))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, ordered by name.
    pub async fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();

        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn breaker(failure_threshold: usize, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "orders:find_by_id",
            CircuitBreakerConfig {
                failure_threshold,
                reset_timeout,
                ..Default::default()
            },
        )
    }

    async fn trip(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn successful_calls_keep_circuit_closed() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        for _ in 0..10 {
            let result = breaker.call(|| async { Ok::<_, ()>(42) }).await;
            assert!(result.is_ok());
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }

        let stats = breaker.metrics();
        assert_eq!(stats.successes, 10);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = breaker(3, Duration::from_secs(60));

        for _ in 0..3 {
            let result = breaker.call(|| async { Err::<(), _>("error") }).await;
            assert!(matches!(result, Err(CircuitBreakerError::ExecutionFailed(_))));
        }

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(breaker.metrics().opened_count, 1);
    }

    #[tokio::test]
    async fn success_decays_failure_count() {
        let breaker = breaker(3, Duration::from_secs(60));
        trip(&breaker, 2).await;
        let _ = breaker.call(|| async { Ok::<_, ()>(()) }).await;

        assert_eq!(breaker.snapshot().await.consecutive_failures, 1);

        trip(&breaker, 1).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        trip(&breaker, 1).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking() {
        let breaker = breaker(2, Duration::from_secs(10));
        trip(&breaker, 2).await;

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(42)
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(breaker.metrics().rejected_count > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_reset_timeout() {
        let breaker = breaker(2, Duration::from_millis(100));
        trip(&breaker, 2).await;

        sleep(Duration::from_millis(150)).await;
        let result = breaker.call(|| async { Ok::<_, ()>(42) }).await;

        assert!(result.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().await.half_open_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_required_successes() {
        let breaker = breaker(2, Duration::from_millis(100));
        trip(&breaker, 2).await;
        sleep(Duration::from_millis(150)).await;

        for _ in 0..3 {
            assert!(breaker.call(|| async { Ok::<_, ()>(1) }).await.is_ok());
        }

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.stats.closed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_reopens_on_failure() {
        let breaker = breaker(2, Duration::from_millis(100));
        trip(&breaker, 2).await;
        sleep(Duration::from_millis(150)).await;

        let _ = breaker.call(|| async { Ok::<_, ()>(1) }).await;
        trip(&breaker, 1).await;

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.half_open_successes, 0);
        assert_eq!(snapshot.stats.opened_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe() {
        let breaker = Arc::new(breaker(2, Duration::from_millis(100)));
        trip(&breaker, 2).await;
        sleep(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, ()>(1)
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        let rejected = breaker.call(|| async { Ok::<_, ()>(2) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Rejected { .. })));
        assert!(rejected.unwrap_err().is_rejection());

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());

        // The slot is free again once the probe finishes.
        assert!(breaker.call(|| async { Ok::<_, ()>(3) }).await.is_ok());
    }

    #[tokio::test]
    async fn manual_reset() {
        let breaker = breaker(2, Duration::from_secs(60));
        trip(&breaker, 2).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.call(|| async { Ok::<_, ()>(42) }).await.is_ok());
    }

    #[tokio::test]
    async fn registry_creates_one_breaker_per_operation() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let a = registry.get_or_create("orders", "find_by_id");
        let b = registry.get_or_create("orders", "find_by_id");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "orders:find_by_id");

        registry.get_or_create("orders", "create");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("vendors", "create").is_none());

        trip(&a, 1).await;
        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots[0].name, "orders:create");
        assert_eq!(snapshots[1].state, CircuitState::Open);

        registry.reset_all().await;
        assert_eq!(a.state().await, CircuitState::Closed);
    }
}
