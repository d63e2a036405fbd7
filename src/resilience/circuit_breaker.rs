//! Circuit Breaker
//!
//! Per-endpoint-class circuit breakers.
//!
//! A breaker opens after `failure_threshold` consecutive failures and stays
//! open until `open_duration` has elapsed since the last recorded failure.
//! The first `is_open()` check after that moves it to half-open, where
//! `success_threshold` successes close it again and any failure re-opens it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::Clock;
use crate::telemetry::{ClientMetrics, NoOpMetrics};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, probe requests allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit.
    pub failure_threshold: u32,
    /// Successes to close circuit from half-open.
    pub success_threshold: u32,
    /// Time since last failure before an open circuit admits a probe.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        DEFAULT_CIRCUIT_BREAKER_CONFIG
    }
}

/// Default circuit breaker configuration.
pub const DEFAULT_CIRCUIT_BREAKER_CONFIG: CircuitBreakerConfig = CircuitBreakerConfig {
    failure_threshold: 5,
    success_threshold: 2,
    open_duration: Duration::from_secs(60),
};

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            half_open_successes: 0,
        }
    }
}

/// Circuit breaker guarding one endpoint class.
pub struct EndpointCircuitBreaker {
    endpoint_class: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    state: Mutex<BreakerState>,
}

impl EndpointCircuitBreaker {
    /// Create new circuit breaker.
    pub fn new(
        endpoint_class: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_metrics(endpoint_class, config, clock, Arc::new(NoOpMetrics))
    }

    /// Create circuit breaker reporting transitions to `metrics`.
    pub fn with_metrics(
        endpoint_class: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        Self {
            endpoint_class: endpoint_class.into(),
            config,
            clock,
            metrics,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    /// Endpoint class this breaker guards.
    pub fn endpoint_class(&self) -> &str {
        &self.endpoint_class
    }

    /// Whether calls must be rejected. Moves an expired open circuit to half-open.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open {
            let elapsed = state
                .last_failure_at
                .map(|at| self.clock.now() - at)
                .and_then(|d| d.to_std().ok());
            if let Some(elapsed) = elapsed {
                if elapsed >= self.config.open_duration {
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
                }
            }
        }
        state.state == CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.half_open_successes = 0;
                    self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(self.clock.now());

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    self.transitioned(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.half_open_successes = 0;
                self.transitioned(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without applying the open timeout.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Time until an open circuit admits a probe.
    pub fn retry_in(&self) -> Duration {
        let state = self.state.lock();
        match (state.state, state.last_failure_at) {
            (CircuitState::Open, Some(at)) => {
                let elapsed = (self.clock.now() - at).to_std().unwrap_or(Duration::ZERO);
                self.config.open_duration.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        }
    }

    /// Snapshot of the breaker state.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
            half_open_successes: state.half_open_successes,
        }
    }

    /// Reset to closed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let previous = state.state;
        *state = BreakerState::closed();
        if previous != CircuitState::Closed {
            self.transitioned(previous, CircuitState::Closed);
        }
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                endpoint_class = %self.endpoint_class,
                from = from.as_str(),
                "Circuit opened"
            ),
            _ => info!(
                endpoint_class = %self.endpoint_class,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit state changed"
            ),
        }
        self.metrics
            .record_circuit_transition(&self.endpoint_class, from.as_str(), to.as_str());
    }
}

/// Lazily created breakers, one per endpoint class.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    breakers: Mutex<HashMap<String, Arc<EndpointCircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create new registry.
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        Self {
            config,
            clock,
            metrics,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `endpoint_class`, created on first use.
    pub fn get(&self, endpoint_class: &str) -> Arc<EndpointCircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(endpoint_class.to_string()).or_insert_with(|| {
            Arc::new(EndpointCircuitBreaker::with_metrics(
                endpoint_class,
                self.config.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.metrics),
            ))
        }))
    }

    /// Snapshots of every breaker created so far.
    pub fn stats(&self) -> HashMap<String, CircuitSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(class, breaker)| (class.clone(), breaker.snapshot()))
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }
}
