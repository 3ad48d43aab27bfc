//! Retry with exponential backoff and jitter, executed through a circuit breaker.
//!
//! The retried call runs through the breaker registered for
//! `service:operation` and every failed attempt is recorded in the error
//! tracker. An open circuit rejects the call before the first attempt.
//!
//! # Example
//!
//! ```no_run
//! use docshield_core::{CallContext, StoreError};
//! use docshield_gateway::observability::ErrorTracker;
//! use docshield_gateway::resilience::{CircuitBreakerRegistry, RetryExecutor, RetryOptions};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let executor = RetryExecutor::new(
//!     Arc::new(CircuitBreakerRegistry::default()),
//!     Arc::new(ErrorTracker::default()),
//! );
//!
//! let result = executor
//!     .execute(
//!         "orders",
//!         "find_many",
//!         &CallContext::anonymous(),
//!         &RetryOptions::default(),
//!         || async { Ok::<_, StoreError>(42) },
//!     )
//!     .await;
//! # }
//! ```

use docshield_core::{CallContext, ErrorKind, ReportableError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
use crate::observability::error_tracker::{ErrorContext, ErrorTracker};

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Scale by a uniform factor in [0.75, 1.25]
    Proportional,
    /// Random value between 0 and calculated delay
    Full,
}

impl Default for JitterStrategy {
    fn default() -> Self {
        Self::Proportional
    }
}

impl JitterStrategy {
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterStrategy::None => delay,
            JitterStrategy::Proportional => {
                let factor = 0.75 + rand::random::<f64>() * 0.5;
                Duration::from_secs_f64(delay.as_secs_f64() * factor)
            }
            JitterStrategy::Full => {
                let jitter = rand::random::<f64>();
                Duration::from_secs_f64(delay.as_secs_f64() * jitter)
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: usize,
    #[serde(with = "docshield_core::duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "docshield_core::duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: JitterStrategy::Proportional,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn base_delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            self.max_delay
        }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.base_delay_for(attempt))
    }
}

/// Information handed to `on_retry` before each backoff sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub attempt_number: usize,
    pub delay: Duration,
    pub error: String,
}

pub type RetryCondition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
pub type RetryHook = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Retry configuration plus the pluggable predicate and hook.
pub struct RetryOptions<E> {
    pub config: RetryConfig,
    pub retry_condition: RetryCondition<E>,
    pub on_retry: Option<RetryHook>,
}

impl<E: ReportableError + 'static> RetryOptions<E> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_condition: Arc::new(|e: &E| is_transient(e)),
            on_retry: None,
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryAttempt) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl<E: ReportableError + 'static> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retry_condition: self.retry_condition.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Default retry predicate: network, timeout and unavailable style failures.
pub fn is_transient<E: ReportableError + ?Sized>(error: &E) -> bool {
    error.kind() == ErrorKind::Transient
}

/// Error wrapper that includes retry attempt information
#[derive(Debug)]
pub struct RetryError<E> {
    /// The underlying error
    pub error: E,
    /// Number of attempts made
    pub attempts: usize,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation failed after {} attempts: {}",
            self.attempts, self.error
        )
    }
}

impl<E: std::error::Error> std::error::Error for RetryError<E> {}

impl<E: ReportableError> ReportableError for CircuitBreakerError<E> {
    fn code(&self) -> Option<&str> {
        match self {
            CircuitBreakerError::ExecutionFailed(e) => e.code(),
            _ => Some("circuit-open"),
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            CircuitBreakerError::ExecutionFailed(e) => e.kind(),
            _ => ErrorKind::CircuitOpen,
        }
    }
}

pub type RetryResult<T, E> = Result<T, RetryError<CircuitBreakerError<E>>>;

pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<ErrorTracker>,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, tracker: Arc<ErrorTracker>) -> Self {
        Self { breakers, tracker }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs `f` until it succeeds, the error is not retryable, the circuit
    /// opens, or `max_attempts` is reached.
    ///
    /// The breaker for `service:operation` guards the whole retried call: an
    /// open circuit rejects it before `f` runs, and only the final outcome
    /// counts as one breaker success or failure. A rejection reports one
    /// attempt.
    pub async fn execute<F, Fut, T, E>(
        &self,
        service: &str,
        operation: &str,
        call: &CallContext,
        options: &RetryOptions<E>,
        f: F,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ReportableError,
    {
        let breaker = self.breakers.get_or_create(service, operation);
        let context = ErrorContext::new(service, operation).with_call(call);

        let outcome = breaker
            .call(|| self.attempt(&breaker, &context, options, f))
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::ExecutionFailed(err)) => Err(RetryError {
                error: CircuitBreakerError::ExecutionFailed(err.error),
                attempts: err.attempts,
            }),
            Err(CircuitBreakerError::Open { name }) => {
                Err(self.rejected(CircuitBreakerError::Open { name }, &context))
            }
            Err(CircuitBreakerError::Rejected { name }) => {
                Err(self.rejected(CircuitBreakerError::Rejected { name }, &context))
            }
        }
    }

    fn rejected<E: ReportableError>(
        &self,
        error: CircuitBreakerError<E>,
        context: &ErrorContext,
    ) -> RetryError<CircuitBreakerError<E>> {
        debug!(
            service = %context.service,
            operation = %context.operation,
            "Rejected by circuit breaker"
        );
        self.tracker.track_error(&error, context);
        RetryError { error, attempts: 1 }
    }

    async fn attempt<F, Fut, T, E>(
        &self,
        breaker: &CircuitBreaker,
        context: &ErrorContext,
        options: &RetryOptions<E>,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ReportableError,
    {
        let service = context.service.as_str();
        let operation = context.operation.as_str();
        let max_attempts = options.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(service, operation, attempt, max_attempts, "Executing attempt");

            let err = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(service, operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.tracker.track_error(&err, context);
            let retryable = (options.retry_condition)(&err);

            // Concurrent callers may have opened the circuit meanwhile.
            let circuit_open = breaker.state().await == CircuitState::Open;
            if attempt >= max_attempts || !retryable || circuit_open {
                if attempt > 1 || retryable {
                    warn!(
                        service,
                        operation,
                        attempts = attempt,
                        circuit_open,
                        "Giving up: {}",
                        err
                    );
                }
                return Err(RetryError {
                    error: err,
                    attempts: attempt,
                });
            }

            let delay = options.config.delay_for(attempt);
            if let Some(ref hook) = options.on_retry {
                hook(&RetryAttempt {
                    attempt_number: attempt,
                    delay,
                    error: err.to_string(),
                });
            }
            debug!(service, operation, attempt, ?delay, "Retrying after backoff");
            sleep(delay).await;
        }
    }

    /// Turns `f` into a retrying function with the same argument, taking the
    /// caller context explicitly.
    pub fn wrap<A, F, Fut, T, E>(
        self: &Arc<Self>,
        service: impl Into<String>,
        operation: impl Into<String>,
        options: RetryOptions<E>,
        f: F,
    ) -> impl Fn(CallContext, A) -> BoxFuture<'static, RetryResult<T, E>>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: ReportableError + Send + Sync + 'static,
    {
        let executor = self.clone();
        let service: Arc<str> = service.into().into();
        let operation: Arc<str> = operation.into().into();
        let f = Arc::new(f);

        move |call: CallContext, args: A| {
            let executor = executor.clone();
            let service = service.clone();
            let operation = operation.clone();
            let options = options.clone();
            let f = f.clone();

            async move {
                executor
                    .execute(&service, &operation, &call, &options, || (*f)(args.clone()))
                    .await
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use docshield_core::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn executor(failure_threshold: usize) -> (RetryExecutor, Arc<ErrorTracker>) {
        let tracker = Arc::new(ErrorTracker::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            ..Default::default()
        }));
        (RetryExecutor::new(breakers, tracker.clone()), tracker)
    }

    fn fast_options() -> RetryOptions<StoreError> {
        RetryOptions::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn backoff_follows_formula() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: JitterStrategy::None,
            ..Default::default()
        };

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_band() {
        let delay = Duration::from_millis(1000);
        for _ in 0..200 {
            let proportional = JitterStrategy::Proportional.apply(delay);
            assert!(proportional >= Duration::from_millis(750));
            assert!(proportional <= Duration::from_millis(1250));

            let full = JitterStrategy::Full.apply(delay);
            assert!(full <= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (executor, tracker) = executor(10);
        let calls = AtomicUsize::new(0);

        let result = executor
            .execute(
                "orders",
                "find_many",
                &CallContext::anonymous(),
                &fast_options(),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StoreError::new("network timeout"))
                    } else {
                        Ok(7)
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.get_all_errors()[0].occurrences, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (executor, _) = executor(10);
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(
                "orders",
                "find_many",
                &CallContext::anonymous(),
                &fast_options(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StoreError::unavailable("backend down"))
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err.error, CircuitBreakerError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (executor, _) = executor(10);
        let calls = AtomicUsize::new(0);

        let err = executor
            .execute(
                "orders",
                "create",
                &CallContext::anonymous(),
                &fast_options(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StoreError::with_code("invalid-argument", "name required"))
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_executions_open_the_circuit() {
        let (executor, tracker) = executor(2);
        let calls = AtomicUsize::new(0);
        let options = fast_options().with_max_attempts(2);
        let call = CallContext::anonymous();
        let (executor_ref, calls_ref, options_ref, call_ref) = (&executor, &calls, &options, &call);
        let run = move || {
            executor_ref.execute("orders", "find_by_id", call_ref, options_ref, move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::new("network timeout"))
            })
        };

        assert_eq!(run().await.unwrap_err().attempts, 2);
        assert_eq!(run().await.unwrap_err().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let breaker = executor.breakers().get("orders", "find_by_id").unwrap();
        assert_eq!(breaker.state().await, CircuitState::Open);

        let rejected = run().await.unwrap_err();
        assert!(rejected.error.is_rejection());
        assert_eq!(rejected.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(tracker
            .get_all_errors()
            .iter()
            .any(|e| e.code.as_deref() == Some("circuit-open")));
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_call_leaves_circuit_closed() {
        let (executor, _) = executor(2);
        let calls = AtomicUsize::new(0);

        let result = executor
            .execute(
                "orders",
                "find_by_id",
                &CallContext::anonymous(),
                &fast_options(),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StoreError::new("network timeout"))
                    } else {
                        Ok("po-1")
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "po-1");
        let snapshot = executor
            .breakers()
            .get("orders", "find_by_id")
            .unwrap()
            .snapshot()
            .await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_sees_each_backoff() {
        let (executor, _) = executor(10);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let options = fast_options().on_retry(move |attempt| {
            seen.lock().unwrap().push((attempt.attempt_number, attempt.delay));
        });

        let _ = executor
            .execute(
                "orders",
                "find_many",
                &CallContext::anonymous(),
                &options,
                || async { Err::<(), _>(StoreError::new("connection reset")) },
            )
            .await;

        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_function_retries_with_context() {
        let (executor, tracker) = executor(10);
        let executor = Arc::new(executor);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let fetch = executor.wrap("vendors", "find_by_id", fast_options(), move |id: String| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::new("socket hang up"))
                } else {
                    Ok(format!("vendor {}", id))
                }
            }
        });

        let result = fetch(CallContext::for_user("u-9"), "v-1".to_string()).await;

        assert_eq!(result.unwrap(), "vendor v-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            tracker.get_all_errors()[0].context.user_id.as_deref(),
            Some("u-9")
        );
    }
}
