//! Rate Limiter
//!
//! Fixed-window quota enforcement per (subject, endpoint class) with a
//! pacing delay after each admission.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::Clock;
use crate::error::{MarketplaceError, RateLimitError};
use crate::telemetry::{ClientMetrics, NoOpMetrics};

/// Static quota for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLimit {
    /// Calls admitted per window.
    pub daily_quota: u32,
    /// Pacing rate; each admission sleeps `1000 / per_second` ms. Zero disables pacing.
    pub per_second: u32,
}

impl EndpointLimit {
    pub const fn new(daily_quota: u32, per_second: u32) -> Self {
        Self {
            daily_quota,
            per_second,
        }
    }

    /// Delay applied after each admission.
    pub fn pacing_delay(&self) -> Duration {
        if self.per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.per_second as u64)
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length; the quota resets this long after the window opened.
    pub window: Duration,
    /// Limit for classes without an explicit entry.
    pub default_limit: EndpointLimit,
    /// Per-class limits.
    pub classes: HashMap<String, EndpointLimit>,
}

impl RateLimitConfig {
    /// Create config with only a default limit.
    pub fn new(default_limit: EndpointLimit) -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
            default_limit,
            classes: HashMap::new(),
        }
    }

    /// Set limit for an endpoint class.
    pub fn with_class(mut self, endpoint_class: impl Into<String>, limit: EndpointLimit) -> Self {
        self.classes.insert(endpoint_class.into(), limit);
        self
    }

    /// Set window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Limit applied to `endpoint_class`.
    pub fn limit_for(&self, endpoint_class: &str) -> EndpointLimit {
        self.classes
            .get(endpoint_class)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(EndpointLimit::new(1_000, 2))
            .with_class("sell", EndpointLimit::new(5_000, 5))
            .with_class("buy", EndpointLimit::new(5_000, 5))
            .with_class("commerce", EndpointLimit::new(1_000, 2))
    }
}

/// Counter for one (subject, endpoint class) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

/// Rate limiter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub rejected: u64,
    pub active_counters: usize,
}

/// Rate limiter interface.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit one call or reject with the window reset time.
    async fn admit(&self, subject: &str, endpoint_class: &str) -> Result<(), MarketplaceError>;

    /// Calls left in the current window.
    fn remaining(&self, subject: &str, endpoint_class: &str) -> u32;

    /// Get rate limiter statistics.
    fn stats(&self) -> RateLimiterStats;

    /// Drop every counter belonging to `subject`.
    fn reset(&self, subject: &str);
}

type CounterKey = (String, String);

/// Fixed-window rate limiter implementation.
pub struct FixedWindowRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    counters: Mutex<HashMap<CounterKey, RateLimitCounter>>,
    stats: Mutex<RateLimiterStats>,
}

impl FixedWindowRateLimiter {
    /// Create new rate limiter.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(config, clock, Arc::new(NoOpMetrics))
    }

    /// Create rate limiter reporting rejections to `metrics`.
    pub fn with_metrics(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        Self {
            config,
            clock,
            metrics,
            counters: Mutex::new(HashMap::new()),
            stats: Mutex::new(RateLimiterStats::default()),
        }
    }

    /// Current counter for a pair, if one exists.
    pub fn counter(&self, subject: &str, endpoint_class: &str) -> Option<RateLimitCounter> {
        self.counters
            .lock()
            .get(&(subject.to_string(), endpoint_class.to_string()))
            .copied()
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::days(1))
    }

    /// Take one unit of quota. The lock is released before any pacing sleep.
    fn try_take(
        &self,
        subject: &str,
        endpoint_class: &str,
        limit: EndpointLimit,
    ) -> Result<u32, RateLimitError> {
        let now = self.clock.now();
        let mut counters = self.counters.lock();
        evict_expired(&mut counters, now);
        let counter = counters
            .entry((subject.to_string(), endpoint_class.to_string()))
            .or_insert_with(|| RateLimitCounter {
                count: 0,
                window_reset_at: now + self.window(),
            });

        if counter.count >= limit.daily_quota {
            return Err(RateLimitError::QuotaExceeded {
                subject: subject.to_string(),
                endpoint_class: endpoint_class.to_string(),
                reset_at: counter.window_reset_at,
            });
        }

        counter.count += 1;
        Ok(counter.count)
    }
}

fn evict_expired(counters: &mut HashMap<CounterKey, RateLimitCounter>, now: DateTime<Utc>) {
    counters.retain(|_, counter| now < counter.window_reset_at);
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn admit(&self, subject: &str, endpoint_class: &str) -> Result<(), MarketplaceError> {
        let limit = self.config.limit_for(endpoint_class);

        match self.try_take(subject, endpoint_class, limit) {
            Ok(count) => {
                self.stats.lock().admitted += 1;
                debug!(
                    subject = subject,
                    endpoint_class = endpoint_class,
                    count = count,
                    quota = limit.daily_quota,
                    "Call admitted"
                );
            }
            Err(error) => {
                self.stats.lock().rejected += 1;
                self.metrics.record_rate_limit_rejection(endpoint_class);
                warn!(
                    subject = subject,
                    endpoint_class = endpoint_class,
                    quota = limit.daily_quota,
                    "Quota exhausted"
                );
                return Err(error.into());
            }
        }

        let pacing = limit.pacing_delay();
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        Ok(())
    }

    fn remaining(&self, subject: &str, endpoint_class: &str) -> u32 {
        let limit = self.config.limit_for(endpoint_class);
        match self.counter(subject, endpoint_class) {
            Some(counter) if self.clock.now() < counter.window_reset_at => {
                limit.daily_quota.saturating_sub(counter.count)
            }
            _ => limit.daily_quota,
        }
    }

    fn stats(&self) -> RateLimiterStats {
        let mut stats = self.stats.lock().clone();
        let mut counters = self.counters.lock();
        evict_expired(&mut counters, self.clock.now());
        stats.active_counters = counters.len();
        stats
    }

    fn reset(&self, subject: &str) {
        self.counters.lock().retain(|(s, _), _| s != subject);
        debug!(subject = subject, "Rate limit counters reset");
    }
}

/// Mock rate limiter for testing.
#[derive(Default)]
pub struct MockRateLimiter {
    should_reject: AtomicBool,
    admit_count: AtomicU32,
    reset_at: Mutex<Option<DateTime<Utc>>>,
}

impl MockRateLimiter {
    /// Create new mock rate limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every call with the given reset time.
    pub fn set_should_reject(&self, should_reject: bool) -> &Self {
        self.should_reject.store(should_reject, Ordering::SeqCst);
        self
    }

    /// Reset time reported on rejection.
    pub fn set_reset_at(&self, reset_at: DateTime<Utc>) -> &Self {
        *self.reset_at.lock() = Some(reset_at);
        self
    }

    /// Number of admit calls seen.
    pub fn get_admit_count(&self) -> u32 {
        self.admit_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimiter for MockRateLimiter {
    async fn admit(&self, subject: &str, endpoint_class: &str) -> Result<(), MarketplaceError> {
        self.admit_count.fetch_add(1, Ordering::SeqCst);
        if self.should_reject.load(Ordering::SeqCst) {
            let reset_at = self
                .reset_at
                .lock()
                .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
            return Err(RateLimitError::QuotaExceeded {
                subject: subject.to_string(),
                endpoint_class: endpoint_class.to_string(),
                reset_at,
            }
            .into());
        }
        Ok(())
    }

    fn remaining(&self, _subject: &str, _endpoint_class: &str) -> u32 {
        if self.should_reject.load(Ordering::SeqCst) {
            0
        } else {
            u32::MAX
        }
    }

    fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admit_count.load(Ordering::SeqCst) as u64,
            ..Default::default()
        }
    }

    fn reset(&self, _subject: &str) {}
}

/// Create rate limiter.
pub fn create_rate_limiter(config: RateLimitConfig, clock: Arc<dyn Clock>) -> impl RateLimiter {
    FixedWindowRateLimiter::new(config, clock)
}

/// Create mock rate limiter for testing.
pub fn create_mock_rate_limiter() -> MockRateLimiter {
    MockRateLimiter::new()
}
