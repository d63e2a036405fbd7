//! Recovery Service
//!
//! Applies the recovery strategy chosen by the classifier and keeps a
//! bounded history of processed errors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::classifier::{ClassifiedError, ErrorCategory, ErrorClassifier, ErrorSeverity, RecoveryStrategy};
use crate::core::Clock;
use crate::error::MarketplaceError;
use crate::telemetry::{ClientMetrics, NoOpMetrics};
use crate::token::{TokenManager, TokenStore};

/// Recovery limits.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Error records kept in history.
    pub history_limit: usize,
    /// Local retries allowed per operation for network failures.
    pub network_retries: u32,
    /// Local retries allowed per operation for rate-limit failures.
    pub rate_limit_retries: u32,
    /// Local retries allowed per operation for server failures.
    pub server_retries: u32,
    /// Local retries allowed per operation for anything else.
    pub default_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Retry delay cap.
    pub max_delay: Duration,
    /// Failures after which an operation is reported as persistently failing.
    pub failure_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            network_retries: 3,
            rate_limit_retries: 2,
            server_retries: 3,
            default_retries: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            failure_threshold: 5,
        }
    }
}

impl RecoveryConfig {
    fn max_retries(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Network => self.network_retries,
            ErrorCategory::RateLimit => self.rate_limit_retries,
            ErrorCategory::Server => self.server_retries,
            _ => self.default_retries,
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One processed error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recovery_strategy: RecoveryStrategy,
    pub occurred_at: DateTime<Utc>,
    pub operation: String,
}

/// Result of a recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Whether the recovery action completed.
    pub success: bool,
    /// Strategy that produced this outcome.
    pub strategy: RecoveryStrategy,
    /// Whether the caller may retry the operation now.
    pub should_retry: bool,
    /// Whether the user must sign in again.
    pub requires_reauth: bool,
    /// Whether the user must act before anything else is attempted.
    pub requires_user_action: bool,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

impl RecoveryOutcome {
    fn retry(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy,
            should_retry: true,
            requires_reauth: false,
            requires_user_action: false,
            message: message.into(),
            suggested_actions: Vec::new(),
        }
    }

    fn reauth(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy,
            should_retry: false,
            requires_reauth: true,
            requires_user_action: true,
            message: message.into(),
            suggested_actions: vec!["Sign in to your marketplace account again".to_string()],
        }
    }

    fn user_action(strategy: RecoveryStrategy, classified: &ClassifiedError) -> Self {
        Self {
            success: false,
            strategy,
            should_retry: false,
            requires_reauth: false,
            requires_user_action: true,
            message: classified.user_message.clone(),
            suggested_actions: classified.suggested_actions.clone(),
        }
    }
}

/// Signal broadcast when the user must authorize again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReauthSignal {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Recovery statistics.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub total_errors: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub recent_errors: Vec<ErrorRecord>,
    /// Operations at or over the failure threshold, with their failure counts.
    pub failing_operations: Vec<(String, u32)>,
}

#[derive(Default)]
struct Tracker {
    history: VecDeque<ErrorRecord>,
    total: u64,
    by_category: HashMap<ErrorCategory, u64>,
    retries: HashMap<String, u32>,
    failures: HashMap<String, u32>,
}

/// Error classification and recovery service.
pub struct RecoveryService {
    classifier: ErrorClassifier,
    token_manager: Arc<dyn TokenManager>,
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    config: RecoveryConfig,
    tracker: Mutex<Tracker>,
    reauth: broadcast::Sender<ReauthSignal>,
}

impl RecoveryService {
    /// Create new recovery service.
    pub fn new(
        token_manager: Arc<dyn TokenManager>,
        store: Arc<TokenStore>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        let (reauth, _) = broadcast::channel(16);
        Self {
            classifier: ErrorClassifier::new(),
            token_manager,
            store,
            clock,
            metrics: Arc::new(NoOpMetrics),
            config,
            tracker: Mutex::new(Tracker::default()),
            reauth,
        }
    }

    /// Set metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Receive re-authorization signals.
    pub fn subscribe_reauth(&self) -> broadcast::Receiver<ReauthSignal> {
        self.reauth.subscribe()
    }

    /// Classify, record and recover from `error` raised by `operation`.
    pub async fn handle(&self, error: &MarketplaceError, operation: &str) -> RecoveryOutcome {
        let classified = self.classifier.classify(error);
        self.record(&classified, operation);
        self.attempt_recovery(&classified, operation).await
    }

    /// Run the recovery strategy for an already classified error.
    pub async fn attempt_recovery(&self, classified: &ClassifiedError, operation: &str) -> RecoveryOutcome {
        match classified.recovery_strategy {
            RecoveryStrategy::Retry => self.retry(classified, operation).await,
            RecoveryStrategy::RefreshToken => self.refresh_token(classified).await,
            RecoveryStrategy::Reauth => self.reauthorize(&classified.technical_detail).await,
            RecoveryStrategy::ClearStorage => self.clear_storage(&classified.technical_detail).await,
            RecoveryStrategy::Fallback => {
                let retried = self.retry(classified, operation).await;
                if retried.success {
                    return RecoveryOutcome {
                        strategy: RecoveryStrategy::Fallback,
                        ..retried
                    };
                }
                RecoveryOutcome {
                    strategy: RecoveryStrategy::Fallback,
                    ..self.clear_storage(&classified.technical_detail).await
                }
            }
            RecoveryStrategy::UserAction => {
                RecoveryOutcome::user_action(RecoveryStrategy::UserAction, classified)
            }
        }
    }

    /// Reset retry and failure counters after `operation` succeeded.
    pub fn record_success(&self, operation: &str) {
        let mut tracker = self.tracker.lock();
        tracker.retries.remove(operation);
        tracker.failures.remove(operation);
    }

    /// Current statistics.
    pub fn stats(&self) -> RecoveryStats {
        let tracker = self.tracker.lock();
        let mut failing_operations: Vec<(String, u32)> = tracker
            .failures
            .iter()
            .filter(|(_, count)| **count >= self.config.failure_threshold)
            .map(|(op, count)| (op.clone(), *count))
            .collect();
        failing_operations.sort();

        RecoveryStats {
            total_errors: tracker.total,
            by_category: tracker.by_category.clone(),
            recent_errors: tracker.history.iter().cloned().collect(),
            failing_operations,
        }
    }

    fn record(&self, classified: &ClassifiedError, operation: &str) {
        let record = ErrorRecord {
            code: classified.code.clone(),
            category: classified.category,
            severity: classified.severity,
            retryable: classified.retryable,
            recovery_strategy: classified.recovery_strategy,
            occurred_at: self.clock.now(),
            operation: operation.to_string(),
        };

        let mut tracker = self.tracker.lock();
        tracker.history.push_back(record);
        while tracker.history.len() > self.config.history_limit {
            tracker.history.pop_front();
        }
        tracker.total += 1;
        *tracker.by_category.entry(classified.category).or_insert(0) += 1;
        *tracker.failures.entry(operation.to_string()).or_insert(0) += 1;
        drop(tracker);

        self.metrics.record_error(classified.category.as_str(), operation);
    }

    async fn retry(&self, classified: &ClassifiedError, operation: &str) -> RecoveryOutcome {
        let max = self.config.max_retries(classified.category);
        let attempt = {
            let mut tracker = self.tracker.lock();
            let count = tracker.retries.entry(operation.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > max {
            warn!(operation, category = %classified.category, max, "Retries exhausted");
            return RecoveryOutcome::user_action(RecoveryStrategy::Retry, classified);
        }

        let delay = self.config.retry_delay(attempt);
        info!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before retry"
        );
        tokio::time::sleep(delay).await;
        RecoveryOutcome::retry(RecoveryStrategy::Retry, format!("retry {} of {}", attempt, max))
    }

    async fn refresh_token(&self, classified: &ClassifiedError) -> RecoveryOutcome {
        match self.token_manager.refresh().await {
            Ok(_) => RecoveryOutcome::retry(RecoveryStrategy::RefreshToken, "token refreshed"),
            Err(e) => {
                warn!(error = %e, "Token refresh during recovery failed");
                let reason = format!("{}; refresh failed: {}", classified.technical_detail, e);
                self.reauthorize(&reason).await
            }
        }
    }

    async fn reauthorize(&self, reason: &str) -> RecoveryOutcome {
        self.token_manager.invalidate().await;
        self.store.clear().await;
        self.signal_reauth(reason);
        RecoveryOutcome::reauth(RecoveryStrategy::Reauth, "sign-in required")
    }

    async fn clear_storage(&self, reason: &str) -> RecoveryOutcome {
        self.token_manager.invalidate().await;
        self.store.clear().await;
        self.signal_reauth(reason);
        RecoveryOutcome::reauth(RecoveryStrategy::ClearStorage, "stored credentials cleared")
    }

    fn signal_reauth(&self, reason: &str) {
        let signal = ReauthSignal {
            reason: reason.to_string(),
            occurred_at: self.clock.now(),
        };
        // No receivers is fine.
        let _ = self.reauth.send(signal);
        warn!(reason, "Re-authorization required");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MockClock;
    use crate::error::{ApiError, AuthError, ConfigurationError, MarketplaceResult, NetworkError, StorageError};
    use crate::token::backend::MockKeyValueStore;
    use crate::token::tiers::{LegacyFieldsTier, StorageTier};
    use crate::token::{AuthState, MockTokenManager};
    use crate::types::TokenRecord;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        pub Manager {}

        #[async_trait]
        impl TokenManager for Manager {
            fn get_access_token(&self) -> Option<String>;
            async fn refresh(&self) -> MarketplaceResult<TokenRecord>;
            fn state(&self) -> AuthState;
            async fn invalidate(&self);
        }
    }

    struct Fixture {
        legacy: Arc<MockKeyValueStore>,
        service: RecoveryService,
    }

    fn fixture(manager: Arc<dyn TokenManager>) -> Fixture {
        let clock = Arc::new(MockClock::default());
        let legacy = Arc::new(MockKeyValueStore::new("legacy"));
        legacy.insert_raw("access_token", "stale");
        let tiers: Vec<Arc<dyn StorageTier>> =
            vec![Arc::new(LegacyFieldsTier::new(legacy.clone(), clock.clone()))];
        let store = Arc::new(TokenStore::new(tiers, clock.clone()));
        Fixture {
            legacy,
            service: RecoveryService::new(manager, store, clock, RecoveryConfig::default()),
        }
    }

    fn timeout() -> MarketplaceError {
        NetworkError::Timeout {
            timeout: Duration::from_secs(30),
        }
        .into()
    }

    fn record() -> TokenRecord {
        TokenRecord {
            access_token: "fresh".to_string(),
            refresh_token: Some("r".to_string()),
            token_type: "Bearer".to_string(),
            issued_at: Utc::now(),
            expires_in_seconds: 7200,
            refresh_expires_in_seconds: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retries_back_off_then_stop() {
        let f = fixture(Arc::new(MockTokenManager::new()));

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            let outcome = f.service.handle(&timeout(), "publish").await;
            assert!(outcome.success && outcome.should_retry);
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 4));

        let exhausted = f.service.handle(&timeout(), "publish").await;
        assert!(!exhausted.success);
        assert!(exhausted.requires_user_action);
        assert!(!exhausted.suggested_actions.is_empty());

        f.service.record_success("publish");
        assert!(f.service.handle(&timeout(), "publish").await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_cap() {
        let f = fixture(Arc::new(MockTokenManager::new()));
        let error = MarketplaceError::Api(ApiError::Status {
            status: 429,
            message: "Too many requests".to_string(),
            retry_after: None,
        });

        assert!(f.service.handle(&error, "search").await.success);
        assert!(f.service.handle(&error, "search").await.success);
        assert!(!f.service.handle(&error, "search").await.success);
    }

    #[tokio::test]
    async fn test_token_error_refreshes() {
        let mut manager = MockManager::new();
        manager.expect_refresh().times(1).returning(|| Ok(record()));
        manager.expect_invalidate().times(0);
        let f = fixture(Arc::new(manager));

        let error: MarketplaceError = AuthError::TokenRefreshRequired {
            endpoint_class: "sell".to_string(),
        }
        .into();
        let outcome = f.service.handle(&error, "publish").await;

        assert_eq!(outcome.strategy, RecoveryStrategy::RefreshToken);
        assert!(outcome.should_retry);
        assert_eq!(f.legacy.get_raw("access_token").as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_failed_refresh_downgrades_to_reauth() {
        let mut manager = MockManager::new();
        manager.expect_refresh().times(1).returning(|| {
            Err(AuthError::ReauthorizationRequired {
                reason: "invalid_grant".to_string(),
            }
            .into())
        });
        manager.expect_invalidate().times(1).returning(|| ());
        let f = fixture(Arc::new(manager));
        let mut signals = f.service.subscribe_reauth();

        let error: MarketplaceError = AuthError::NotAuthenticated.into();
        let outcome = f.service.handle(&error, "publish").await;

        assert_eq!(outcome.strategy, RecoveryStrategy::Reauth);
        assert!(outcome.requires_reauth);
        assert!(f.legacy.get_raw("access_token").is_none());
        let signal = signals.recv().await.unwrap();
        assert!(signal.reason.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_storage_error_clears_storage() {
        let manager = Arc::new(MockTokenManager::with_token("t"));
        let f = fixture(manager.clone());

        let error: MarketplaceError = StorageError::CorruptedData {
            tier: "encrypted-store".to_string(),
            message: "bad tag".to_string(),
        }
        .into();
        let outcome = f.service.handle(&error, "load").await;

        assert_eq!(outcome.strategy, RecoveryStrategy::ClearStorage);
        assert!(outcome.requires_reauth);
        assert_eq!(manager.get_invalidate_count(), 1);
        assert!(f.legacy.get_raw("access_token").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_falls_back() {
        let f = fixture(Arc::new(MockTokenManager::new()));
        let error = MarketplaceError::upstream("boom");

        let first = f.service.handle(&error, "misc").await;
        assert_eq!(first.strategy, RecoveryStrategy::Fallback);
        assert!(first.should_retry);

        let second = f.service.handle(&error, "misc").await;
        assert_eq!(second.strategy, RecoveryStrategy::Fallback);
        assert!(second.requires_reauth);
        assert!(f.legacy.get_raw("access_token").is_none());
    }

    #[tokio::test]
    async fn test_configuration_error_is_terminal() {
        let f = fixture(Arc::new(MockTokenManager::new()));
        let error: MarketplaceError = ConfigurationError::MissingRequired {
            field: "MARKETPLACE_CLIENT_ID".to_string(),
        }
        .into();

        let outcome = f.service.handle(&error, "startup").await;
        assert!(!outcome.success);
        assert!(outcome.requires_user_action);
        assert!(!outcome.requires_reauth);
        assert_eq!(f.legacy.get_raw("access_token").as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_stats_track_failures() {
        let f = fixture(Arc::new(MockTokenManager::new()));
        let error: MarketplaceError = ConfigurationError::MissingRequired {
            field: "x".to_string(),
        }
        .into();

        for i in 0..105 {
            let operation = if i % 2 == 0 { "even" } else { "odd" };
            f.service.handle(&error, operation).await;
        }
        f.service.record_success("odd");

        let stats = f.service.stats();
        assert_eq!(stats.total_errors, 105);
        assert_eq!(stats.recent_errors.len(), 100);
        assert_eq!(stats.by_category[&ErrorCategory::Configuration], 105);
        assert_eq!(stats.failing_operations, vec![("even".to_string(), 53)]);
    }
}
