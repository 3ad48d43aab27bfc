//! Resilience patterns around backend calls.
//!
//! - **Circuit Breaker**: stops calling a failing backend operation for a
//!   cooldown period, then probes for recovery
//! - **Retry**: bounded exponential backoff with jitter, run through the breaker
//!
//! # Example
//!
//! ```no_run
//! use docshield_gateway::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("vendors:find_many", CircuitBreakerConfig::default());
//! let result = breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitBreakerStats, CircuitState,
};
pub use retry::{
    is_transient, JitterStrategy, RetryAttempt, RetryConfig, RetryError, RetryExecutor,
    RetryOptions, RetryResult,
};
