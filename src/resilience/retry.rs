//! Retry Logic
//!
//! Exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff ceiling for the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff ceiling.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Draw the delay uniformly from `[0, ceiling]` instead of using the ceiling.
    pub full_jitter: bool,
    /// Wait after a server rate-limit response without `Retry-After`.
    pub rate_limit_wait: Duration,
    /// Wait when the rate-limit response names a daily quota exhaustion.
    pub quota_exhausted_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        DEFAULT_RETRY_CONFIG
    }
}

/// Default retry configuration.
pub const DEFAULT_RETRY_CONFIG: RetryConfig = RetryConfig {
    max_attempts: 5,
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(30),
    multiplier: 2.0,
    full_jitter: true,
    rate_limit_wait: Duration::from_secs(60),
    quota_exhausted_wait: Duration::from_secs(300),
};

impl RetryConfig {
    /// Backoff ceiling before retry number `retry` (1-based).
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if !self.full_jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Wait applied to a rate-limit failure.
    pub fn rate_limit_delay(&self, retry_after: Option<Duration>, quota_exhausted: bool) -> Duration {
        match retry_after {
            Some(delay) => delay,
            None if quota_exhausted => self.quota_exhausted_wait,
            None => self.rate_limit_wait,
        }
    }
}
