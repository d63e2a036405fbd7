//! Resilient Executor
//!
//! Runs outbound marketplace calls through the rate limiter, the endpoint
//! class circuit breaker and a classified retry loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::rate_limiter::RateLimiter;
use super::retry::RetryConfig;
use crate::error::{AuthError, ConfigurationError, MarketplaceError, MarketplaceResult, NetworkError};
use crate::recovery::classifier::{category_of, is_quota_exhaustion, ErrorCategory};
use crate::telemetry::{ClientMetrics, NoOpMetrics};
use crate::token::TokenManager;

/// Identifies who is calling which API surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Quota subject, usually the seller account.
    pub subject: String,
    /// Endpoint class selecting quota and circuit breaker.
    pub endpoint_class: String,
    /// Per-attempt timeout overriding the executor default.
    pub timeout: Option<Duration>,
}

impl CallContext {
    /// Create new call context.
    pub fn new(subject: impl Into<String>, endpoint_class: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            endpoint_class: endpoint_class.into(),
            timeout: None,
        }
    }

    /// Set per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Orchestrates admission, circuit breaking and retries for one call.
pub struct ResilientExecutor {
    rate_limiter: Arc<dyn RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryConfig,
    metrics: Arc<dyn ClientMetrics>,
    token_manager: Option<Arc<dyn TokenManager>>,
    default_timeout: Option<Duration>,
}

impl ResilientExecutor {
    /// Create new executor.
    pub fn new(
        rate_limiter: Arc<dyn RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            rate_limiter,
            breakers,
            retry,
            metrics: Arc::new(NoOpMetrics),
            token_manager: None,
            default_timeout: None,
        }
    }

    /// Report calls and retries to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach the token manager used by `execute_authenticated`.
    pub fn with_token_manager(mut self, token_manager: Arc<dyn TokenManager>) -> Self {
        self.token_manager = Some(token_manager);
        self
    }

    /// Default per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Circuit breakers used by this executor.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Execute `operation` under quota, circuit breaker and retry policy.
    pub async fn execute<T, F, Fut>(&self, context: &CallContext, mut operation: F) -> MarketplaceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MarketplaceResult<T>>,
    {
        let class = context.endpoint_class.as_str();

        self.rate_limiter.admit(&context.subject, class).await?;

        let breaker = self.breakers.get(class);
        if breaker.is_open() {
            self.metrics.record_call(class, false);
            debug!(endpoint_class = class, "Circuit open, call rejected");
            return Err(NetworkError::ServiceUnavailable {
                endpoint_class: class.to_string(),
                retry_in: breaker.retry_in(),
            }
            .into());
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match self.run_attempt(context, &mut operation).await {
                Ok(value) => {
                    breaker.record_success();
                    self.metrics.record_call(class, true);
                    if attempt > 1 {
                        info!(endpoint_class = class, attempt = attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let category = category_of(&error);
            match category {
                ErrorCategory::Authentication | ErrorCategory::Token => {
                    self.metrics.record_call(class, false);
                    if error.needs_reauth() {
                        return Err(error);
                    }
                    debug!(endpoint_class = class, error = %error, "Token refresh required");
                    return Err(AuthError::TokenRefreshRequired {
                        endpoint_class: class.to_string(),
                    }
                    .into());
                }
                ErrorCategory::Configuration => {
                    self.metrics.record_call(class, false);
                    return Err(error);
                }
                ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Server => {
                    if attempt >= max_attempts {
                        warn!(
                            endpoint_class = class,
                            attempts = attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        breaker.record_failure();
                        self.metrics.record_call(class, false);
                        return Err(error);
                    }

                    let delay = if category == ErrorCategory::RateLimit {
                        self.retry
                            .rate_limit_delay(error.retry_after(), is_quota_exhaustion(&error))
                    } else {
                        self.retry.calculate_delay(attempt)
                    };

                    debug!(
                        endpoint_class = class,
                        attempt = attempt,
                        category = %category,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying call"
                    );
                    self.metrics
                        .record_retry(class, attempt, delay.as_millis() as u64);
                    tokio::time::sleep(delay).await;
                }
                ErrorCategory::Storage | ErrorCategory::Client | ErrorCategory::Unknown => {
                    breaker.record_failure();
                    self.metrics.record_call(class, false);
                    return Err(error);
                }
            }
        }
    }

    /// Execute an operation that needs an access token.
    ///
    /// When the call reports that the token must be refreshed, the token
    /// manager refreshes once and the operation is resubmitted once.
    pub async fn execute_authenticated<T, F, Fut>(
        &self,
        context: &CallContext,
        mut operation: F,
    ) -> MarketplaceResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = MarketplaceResult<T>>,
    {
        let manager = self.token_manager.as_ref().ok_or_else(|| {
            ConfigurationError::InvalidConfig {
                message: "executor has no token manager".to_string(),
            }
        })?;

        let mut refreshed = false;
        loop {
            let token = match manager.get_access_token() {
                Some(token) => token,
                None if !refreshed => {
                    refreshed = true;
                    manager.refresh().await?;
                    continue;
                }
                None => return Err(AuthError::NotAuthenticated.into()),
            };

            match self.execute(context, || operation(token.clone())).await {
                Err(MarketplaceError::Auth(AuthError::TokenRefreshRequired { .. })) if !refreshed => {
                    refreshed = true;
                    info!(
                        endpoint_class = %context.endpoint_class,
                        "Refreshing token before resubmitting call"
                    );
                    manager.refresh().await?;
                }
                outcome => return outcome,
            }
        }
    }

    async fn run_attempt<T, F, Fut>(&self, context: &CallContext, operation: &mut F) -> MarketplaceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MarketplaceResult<T>>,
    {
        match context.timeout.or(self.default_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout { timeout }.into()),
            },
            None => operation().await,
        }
    }
}
