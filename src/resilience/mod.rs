//! Resilience
//!
//! Resilience patterns for outbound marketplace calls.
//!
//! This module provides:
//!
//! - **Rate Limiter**: Fixed-window daily quotas with pacing
//! - **Circuit Breaker**: One breaker per endpoint class
//! - **Retry**: Exponential backoff with full jitter
//! - **Executor**: Orchestrates all three around a call

pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;
pub mod retry;

// Circuit Breaker
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    EndpointCircuitBreaker, DEFAULT_CIRCUIT_BREAKER_CONFIG,
};

// Executor
pub use executor::{CallContext, ResilientExecutor};

// Rate Limiter
pub use rate_limiter::{
    create_mock_rate_limiter, create_rate_limiter, EndpointLimit, FixedWindowRateLimiter,
    MockRateLimiter, RateLimitConfig, RateLimitCounter, RateLimiter, RateLimiterStats,
};

// Retry
pub use retry::{RetryConfig, DEFAULT_RETRY_CONFIG};
