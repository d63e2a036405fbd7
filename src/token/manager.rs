//! Token Manager
//!
//! Owns the live token record: code exchange, single-flight refresh,
//! scheduled renewal ahead of expiry and refresh notifications.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::store::TokenStore;
use crate::core::{Clock, RefreshScheduler, ScheduleHandle};
use crate::error::{AuthError, MarketplaceError, MarketplaceResult, ProtocolError};
use crate::flows::AuthorizationCodeFlow;
use crate::telemetry::{ClientMetrics, NoOpMetrics};
use crate::types::{
    MarketplaceConfig, TokenRecord, DEFAULT_MIN_REFRESH_DELAY_SECS, DEFAULT_REFRESH_LEAD_SECS,
};

/// Authentication state of a token manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// Identifier returned by [`TokenLifecycleManager::on_refresh`].
pub type SubscriptionId = u64;

/// Callback invoked with every newly installed token.
pub type RefreshCallback = Arc<dyn Fn(&TokenRecord) + Send + Sync>;

/// Token manager interface used by the call orchestrator and recovery.
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Current access token, if one is held and not expired. Never refreshes.
    fn get_access_token(&self) -> Option<String>;

    /// Redeem the refresh token for a new access token.
    async fn refresh(&self) -> MarketplaceResult<TokenRecord>;

    /// Current state.
    fn state(&self) -> AuthState;

    /// Drop the in-memory token and pending refresh. Storage is untouched.
    async fn invalidate(&self);
}

/// Token manager timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct TokenManagerConfig {
    /// How long before hard expiry the scheduled refresh fires.
    pub refresh_lead: Duration,
    /// Lower bound on the scheduled refresh delay.
    pub min_refresh_delay: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_lead: Duration::from_secs(DEFAULT_REFRESH_LEAD_SECS),
            min_refresh_delay: Duration::from_secs(DEFAULT_MIN_REFRESH_DELAY_SECS),
        }
    }
}

impl TokenManagerConfig {
    /// Create from marketplace configuration.
    pub fn from_config(config: &MarketplaceConfig) -> Self {
        Self {
            refresh_lead: config.refresh_lead,
            min_refresh_delay: config.min_refresh_delay,
        }
    }
}

/// Token lifecycle manager.
///
/// Created behind an `Arc`; scheduled refreshes hold only a weak reference,
/// so dropping the last handle stops renewal.
pub struct TokenLifecycleManager {
    me: Weak<TokenLifecycleManager>,
    flow: Arc<dyn AuthorizationCodeFlow>,
    store: Arc<TokenStore>,
    scheduler: Arc<dyn RefreshScheduler>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    config: TokenManagerConfig,
    slot: Mutex<Option<TokenRecord>>,
    state: Mutex<AuthState>,
    timer: Mutex<Option<ScheduleHandle>>,
    subscribers: Mutex<Vec<(SubscriptionId, RefreshCallback)>>,
    next_subscription: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl TokenLifecycleManager {
    /// Create new token manager.
    pub fn new(
        flow: Arc<dyn AuthorizationCodeFlow>,
        store: Arc<TokenStore>,
        scheduler: Arc<dyn RefreshScheduler>,
        clock: Arc<dyn Clock>,
        config: TokenManagerConfig,
    ) -> Arc<Self> {
        Self::with_metrics(flow, store, scheduler, clock, config, Arc::new(NoOpMetrics))
    }

    /// Create new token manager reporting to `metrics`.
    pub fn with_metrics(
        flow: Arc<dyn AuthorizationCodeFlow>,
        store: Arc<TokenStore>,
        scheduler: Arc<dyn RefreshScheduler>,
        clock: Arc<dyn Clock>,
        config: TokenManagerConfig,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            flow,
            store,
            scheduler,
            clock,
            metrics,
            config,
            slot: Mutex::new(None),
            state: Mutex::new(AuthState::Unauthenticated),
            timer: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// Build the consent URL for the given anti-forgery `state`.
    pub fn build_authorization_url(&self, state: &str) -> MarketplaceResult<Url> {
        self.flow.build_authorization_url(state)
    }

    /// Exchange an authorization code and install the resulting token.
    pub async fn exchange_code(&self, code: &str) -> MarketplaceResult<TokenRecord> {
        self.exchange_code_for(code, None).await
    }

    /// Exchange an authorization code on behalf of `owner_id`.
    pub async fn exchange_code_for(
        &self,
        code: &str,
        owner_id: Option<&str>,
    ) -> MarketplaceResult<TokenRecord> {
        let response = self.flow.exchange_code(code).await?;
        let record = TokenRecord::from_response(&response, self.clock.now(), None)?;
        if !record.is_structurally_valid() {
            return Err(ProtocolError::MissingField {
                field: "access_token".to_string(),
            }
            .into());
        }

        self.install(&record, owner_id).await;
        info!(expires_in = record.expires_in_seconds, "Authorization code exchanged");
        Ok(record)
    }

    /// Refresh the access token.
    ///
    /// Concurrent callers share one token endpoint call. On failure the
    /// in-memory token and pending refresh are dropped and the caller must
    /// re-authorize.
    pub async fn refresh(&self) -> MarketplaceResult<TokenRecord> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed {
            debug!("Joined refresh completed by another caller");
            return match self.slot.lock().clone() {
                Some(record) => Ok(record),
                None => Err(AuthError::ReauthorizationRequired {
                    reason: "token refresh failed".to_string(),
                }
                .into()),
            };
        }

        let prior = self.slot.lock().as_ref().and_then(|r| r.refresh_token.clone());
        let Some(refresh_token) = prior.filter(|t| !t.is_empty()) else {
            return Err(self.fail(AuthError::NoRefreshToken.into()));
        };

        self.set_state(AuthState::Refreshing);
        let refreshed = self.flow.refresh_token(&refresh_token).await.and_then(|response| {
            TokenRecord::from_response(&response, self.clock.now(), Some(&refresh_token))
                .map_err(Into::into)
        });
        match refreshed {
            Ok(record) => {
                self.install(&record, None).await;
                self.metrics.record_token_refresh(true);
                self.generation.fetch_add(1, Ordering::SeqCst);
                info!(expires_in = record.expires_in_seconds, "Access token refreshed");
                Ok(record)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Restore the token from storage at startup.
    ///
    /// When only an expired record with a refresh token is stored, it is
    /// refreshed immediately.
    pub async fn initialize(&self) -> AuthState {
        if let Some(record) = self.store.load().await {
            *self.slot.lock() = Some(record.clone());
            self.set_state(AuthState::Authenticated);
            self.schedule_refresh(&record);
            info!("Token restored from storage");
            return AuthState::Authenticated;
        }

        if let Some(record) = self.store.load_refreshable().await {
            *self.slot.lock() = Some(record);
            info!("Stored token expired, refreshing");
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Refresh of stored token failed");
            }
        }
        self.state()
    }

    /// Forget the token everywhere: timer, memory and storage.
    pub async fn logout(&self) {
        self.reset_session();
        self.store.clear().await;
        info!("Logged out");
    }

    /// Register a callback invoked after every token installation.
    pub fn on_refresh<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TokenRecord) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Copy of the held token record, expired or not.
    pub fn current_record(&self) -> Option<TokenRecord> {
        self.slot.lock().clone()
    }

    /// Whether a non-expired token is held.
    pub fn is_authenticated(&self) -> bool {
        self.get_access_token().is_some()
    }

    /// Current access token, if one is held and not expired.
    pub fn get_access_token(&self) -> Option<String> {
        let now = self.clock.now();
        self.slot
            .lock()
            .as_ref()
            .filter(|r| r.is_valid_at(now))
            .map(|r| r.access_token.clone())
    }

    fn set_state(&self, state: AuthState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Auth state changed");
            *current = state;
        }
    }

    async fn install(&self, record: &TokenRecord, owner_id: Option<&str>) {
        *self.slot.lock() = Some(record.clone());
        self.set_state(AuthState::Authenticated);

        if let Err(e) = self.store.save(record, owner_id).await {
            warn!(error = %e, "Token could not be persisted");
        }

        self.schedule_refresh(record);
        self.notify(record);
    }

    fn fail(&self, error: MarketplaceError) -> MarketplaceError {
        warn!(error = %error, "Token refresh failed");
        self.reset_session();
        self.metrics.record_token_refresh(false);
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let MarketplaceError::Auth(AuthError::ReauthorizationRequired { .. }) = error {
            return error;
        }
        AuthError::ReauthorizationRequired {
            reason: error.to_string(),
        }
        .into()
    }

    fn reset_session(&self) {
        self.cancel_timer();
        *self.slot.lock() = None;
        self.set_state(AuthState::Unauthenticated);
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            self.scheduler.cancel(handle);
        }
    }

    fn schedule_refresh(&self, record: &TokenRecord) {
        let lead = chrono::Duration::from_std(self.config.refresh_lead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let Some(fire_at) = record.expires_at().and_then(|at| at.checked_sub_signed(lead)) else {
            warn!("Token expiry out of range; refresh not scheduled");
            return;
        };
        let delay = (fire_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(self.config.min_refresh_delay);

        let me = self.me.clone();
        let task = Box::pin(async move {
            let Some(manager) = me.upgrade() else {
                return;
            };
            if let Err(e) = TokenManager::refresh(&*manager).await {
                warn!(error = %e, "Scheduled token refresh failed");
            }
        });

        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            self.scheduler.cancel(previous);
        }
        *timer = Some(self.scheduler.schedule(delay, task));
        debug!(delay_secs = delay.as_secs(), "Token refresh scheduled");
    }

    fn notify(&self, record: &TokenRecord) {
        let callbacks: Vec<RefreshCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(record);
        }
    }
}

#[async_trait]
impl TokenManager for TokenLifecycleManager {
    fn get_access_token(&self) -> Option<String> {
        TokenLifecycleManager::get_access_token(self)
    }

    async fn refresh(&self) -> MarketplaceResult<TokenRecord> {
        TokenLifecycleManager::refresh(self).await
    }

    fn state(&self) -> AuthState {
        TokenLifecycleManager::state(self)
    }

    async fn invalidate(&self) {
        self.reset_session();
    }
}

/// Mock token manager for testing.
///
/// Successful refreshes install `refreshed-{n}`.
pub struct MockTokenManager {
    token: Mutex<Option<String>>,
    refresh_fails: Mutex<bool>,
    refresh_count: AtomicU32,
    invalidate_count: AtomicU32,
}

impl MockTokenManager {
    /// Create new mock manager with no token.
    pub fn new() -> Self {
        Self {
            token: Mutex::new(None),
            refresh_fails: Mutex::new(false),
            refresh_count: AtomicU32::new(0),
            invalidate_count: AtomicU32::new(0),
        }
    }

    /// Create new mock manager holding `token`.
    pub fn with_token(token: &str) -> Self {
        let manager = Self::new();
        manager.set_access_token(Some(token));
        manager
    }

    /// Replace the held token.
    pub fn set_access_token(&self, token: Option<&str>) -> &Self {
        *self.token.lock() = token.map(String::from);
        self
    }

    /// Make refreshes fail with a re-authorization error.
    pub fn set_refresh_fails(&self, fails: bool) -> &Self {
        *self.refresh_fails.lock() = fails;
        self
    }

    /// Number of refresh calls.
    pub fn get_refresh_count(&self) -> u32 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Number of invalidate calls.
    pub fn get_invalidate_count(&self) -> u32 {
        self.invalidate_count.load(Ordering::SeqCst)
    }
}

impl Default for MockTokenManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenManager for MockTokenManager {
    fn get_access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    async fn refresh(&self) -> MarketplaceResult<TokenRecord> {
        let n = self.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.refresh_fails.lock() {
            *self.token.lock() = None;
            return Err(AuthError::ReauthorizationRequired {
                reason: "mock refresh failure".to_string(),
            }
            .into());
        }

        let token = format!("refreshed-{}", n);
        *self.token.lock() = Some(token.clone());
        Ok(TokenRecord {
            access_token: token,
            refresh_token: Some("mock-refresh".to_string()),
            token_type: "Bearer".to_string(),
            issued_at: chrono::Utc::now(),
            expires_in_seconds: 7200,
            refresh_expires_in_seconds: None,
        })
    }

    fn state(&self) -> AuthState {
        if self.token.lock().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    async fn invalidate(&self) {
        self.invalidate_count.fetch_add(1, Ordering::SeqCst);
        *self.token.lock() = None;
    }
}

/// Create mock token manager for testing.
pub fn create_mock_token_manager() -> MockTokenManager {
    MockTokenManager::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualScheduler, MockClock};
    use crate::flows::MockAuthorizationCodeFlow;
    use crate::token::backend::MockKeyValueStore;
    use crate::token::tiers::{LegacyFieldsTier, SessionTier, StorageTier};
    use crate::types::TokenResponse;

    struct Fixture {
        clock: Arc<MockClock>,
        scheduler: Arc<ManualScheduler>,
        flow: Arc<MockAuthorizationCodeFlow>,
        store: Arc<TokenStore>,
        manager: Arc<TokenLifecycleManager>,
    }

    fn store_over(clock: Arc<MockClock>, legacy: Arc<MockKeyValueStore>) -> Arc<TokenStore> {
        let tiers: Vec<Arc<dyn StorageTier>> = vec![
            Arc::new(SessionTier::new()),
            Arc::new(LegacyFieldsTier::new(legacy, clock.clone())),
        ];
        Arc::new(TokenStore::new(tiers, clock))
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MockClock::default());
        let store = store_over(clock.clone(), Arc::new(MockKeyValueStore::new("legacy")));
        manager_over(clock, store)
    }

    fn manager_over(clock: Arc<MockClock>, store: Arc<TokenStore>) -> Fixture {
        let scheduler = Arc::new(ManualScheduler::new());
        let flow = Arc::new(MockAuthorizationCodeFlow::new());
        let manager = TokenLifecycleManager::new(
            flow.clone(),
            store.clone(),
            scheduler.clone(),
            clock.clone(),
            TokenManagerConfig::default(),
        );
        Fixture {
            clock,
            scheduler,
            flow,
            store,
            manager,
        }
    }

    fn response(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            token_type: "User Access Token".to_string(),
            expires_in,
            refresh_token: refresh.map(String::from),
            refresh_token_expires_in: refresh.map(|_| 47_304_000),
        }
    }

    #[tokio::test]
    async fn test_exchange_installs_and_schedules() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));

        let record = f.manager.exchange_code("code-1").await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("r1"));
        assert_eq!(f.manager.state(), AuthState::Authenticated);
        assert_eq!(f.manager.get_access_token().as_deref(), Some("a1"));
        assert_eq!(f.flow.get_exchange_history(), vec!["code-1"]);
        assert_eq!(f.scheduler.pending_delays(), vec![Duration::from_secs(6600)]);
        assert_eq!(f.store.load().await, Some(record));
    }

    #[tokio::test]
    async fn test_short_lived_token_schedules_minimum_delay() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 400));

        f.manager.exchange_code("code-1").await.unwrap();
        assert_eq!(f.scheduler.pending_delays(), vec![Duration::from_secs(60)]);
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_is_rejected() {
        let f = fixture();
        f.flow
            .queue_token_response(response("a1", Some("r1"), 10_000_000_000_000_000));

        let error = f.manager.exchange_code("code-1").await.unwrap_err();
        assert!(matches!(
            error,
            MarketplaceError::Protocol(ProtocolError::InvalidResponse { .. })
        ));
        assert_eq!(f.manager.state(), AuthState::Unauthenticated);
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.store.load().await, None);

        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-2").await.unwrap();
        f.flow.queue_token_response(response("a2", None, u64::MAX));

        let error = f.manager.refresh().await.unwrap_err();
        assert!(error.needs_reauth());
        assert!(!f.manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_preserves_refresh_token() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();

        let refreshed = f.manager.refresh().await.unwrap();
        assert_eq!(refreshed.access_token, "access-1");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
        assert_eq!(f.flow.get_refresh_history(), vec!["r1"]);

        assert_eq!(f.scheduler.cancelled_count(), 1);
        assert_eq!(f.scheduler.pending(), 1);
        let stored = f.store.load().await.unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_refresh_failure_requires_reauthorization() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();

        f.flow.queue_error(
            AuthError::RefreshFailed {
                message: "invalid_grant".to_string(),
            }
            .into(),
        );
        let error = f.manager.refresh().await.unwrap_err();

        assert!(matches!(
            error,
            MarketplaceError::Auth(AuthError::ReauthorizationRequired { .. })
        ));
        assert_eq!(f.manager.state(), AuthState::Unauthenticated);
        assert_eq!(f.manager.get_access_token(), None);
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_refresh_without_token_fails() {
        let f = fixture();
        assert!(f.manager.refresh().await.unwrap_err().needs_reauth());
        assert!(f.flow.get_refresh_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_is_single_flight() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();
        f.flow.set_latency(Duration::from_secs(1));

        let (first, second) = tokio::join!(f.manager.refresh(), f.manager.refresh());
        assert_eq!(first.unwrap().access_token, "access-1");
        assert_eq!(second.unwrap().access_token, "access-1");
        assert_eq!(f.flow.get_refresh_history().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_refresh_runs() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();

        assert_eq!(f.scheduler.run_pending().await, 1);
        assert_eq!(f.manager.get_access_token().as_deref(), Some("access-1"));
        assert_eq!(f.scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_refresh_notifications() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let id = f
            .manager
            .on_refresh(move |record| log.lock().push(record.access_token.clone()));

        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();
        f.manager.refresh().await.unwrap();

        assert!(f.manager.unsubscribe(id));
        assert!(!f.manager.unsubscribe(id));
        f.manager.refresh().await.unwrap();

        assert_eq!(*seen.lock(), vec!["a1".to_string(), "access-1".to_string()]);
    }

    #[tokio::test]
    async fn test_access_token_hidden_inside_expiry_margin() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 3600));
        f.manager.exchange_code("code-1").await.unwrap();

        f.clock.advance(Duration::from_secs(3301));
        assert_eq!(f.manager.get_access_token(), None);
        assert!(f.manager.current_record().is_some());
        assert_eq!(f.manager.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_initialize_restores_from_storage() {
        let clock = Arc::new(MockClock::default());
        let legacy = Arc::new(MockKeyValueStore::new("legacy"));

        let first = manager_over(clock.clone(), store_over(clock.clone(), legacy.clone()));
        first.flow.queue_token_response(response("a1", Some("r1"), 7200));
        first.manager.exchange_code("code-1").await.unwrap();

        let restarted = manager_over(clock.clone(), store_over(clock, legacy));
        assert_eq!(restarted.manager.initialize().await, AuthState::Authenticated);
        assert_eq!(restarted.manager.get_access_token().as_deref(), Some("a1"));
        assert!(restarted.flow.get_refresh_history().is_empty());
        assert_eq!(restarted.scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_initialize_refreshes_expired_token() {
        let clock = Arc::new(MockClock::default());
        let legacy = Arc::new(MockKeyValueStore::new("legacy"));

        let first = manager_over(clock.clone(), store_over(clock.clone(), legacy.clone()));
        first.flow.queue_token_response(response("a1", Some("r1"), 7200));
        first.manager.exchange_code("code-1").await.unwrap();

        clock.advance(Duration::from_secs(8000));
        let restarted = manager_over(clock.clone(), store_over(clock, legacy));
        assert_eq!(restarted.manager.initialize().await, AuthState::Authenticated);
        assert_eq!(restarted.flow.get_refresh_history(), vec!["r1"]);
        assert_eq!(restarted.manager.get_access_token().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let f = fixture();
        f.flow.queue_token_response(response("a1", Some("r1"), 7200));
        f.manager.exchange_code("code-1").await.unwrap();

        f.manager.logout().await;
        assert_eq!(f.manager.state(), AuthState::Unauthenticated);
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.store.load().await, None);
        assert_eq!(f.manager.initialize().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_exchange_failure_leaves_state() {
        let f = fixture();
        f.flow.queue_error(
            AuthError::ExchangeFailed {
                status: 400,
                error: Some("invalid_grant".to_string()),
                description: "code expired".to_string(),
            }
            .into(),
        );

        assert!(f.manager.exchange_code("stale").await.is_err());
        assert_eq!(f.manager.state(), AuthState::Unauthenticated);
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_mock_token_manager() {
        let manager = create_mock_token_manager();
        assert_eq!(manager.state(), AuthState::Unauthenticated);

        let record = manager.refresh().await.unwrap();
        assert_eq!(record.access_token, "refreshed-1");
        assert_eq!(manager.get_access_token().as_deref(), Some("refreshed-1"));

        manager.invalidate().await;
        assert_eq!(manager.get_invalidate_count(), 1);
        assert_eq!(manager.get_access_token(), None);
    }
}
