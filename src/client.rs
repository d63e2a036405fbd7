//! Marketplace Client
//!
//! Wires transport, encryption, token storage, token lifecycle, quota,
//! circuit breakers, retry and recovery into one client.

use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::core::{
    Clock, HttpTransport, RefreshScheduler, ReqwestHttpTransport, SystemClock, TokioScheduler,
};
use crate::crypto::EncryptionService;
use crate::error::{MarketplaceError, MarketplaceResult};
use crate::flows::AuthorizationCodeFlowImpl;
use crate::recovery::{RecoveryConfig, RecoveryOutcome, RecoveryService};
use crate::resilience::{CallContext, CircuitBreakerRegistry, FixedWindowRateLimiter, ResilientExecutor};
use crate::telemetry::{ClientMetrics, NoOpMetrics};
use crate::token::{
    AuthState, EncryptedStoreTier, FileKeyValueStore, LegacyFieldsTier, RemoteBackupTier,
    SessionTier, StorageTier, StructuredDocumentTier, TokenLifecycleManager, TokenManagerConfig,
    TokenStore,
};
use crate::types::{MarketplaceConfig, TokenRecord};

const MAX_RESPONSE_SIZE: usize = 1048576; // 1MB

/// Resilient authenticated marketplace client.
pub struct MarketplaceClient {
    config: Arc<MarketplaceConfig>,
    store: Arc<TokenStore>,
    token_manager: Arc<TokenLifecycleManager>,
    executor: ResilientExecutor,
    recovery: RecoveryService,
}

impl MarketplaceClient {
    /// Create a new client with default implementations.
    pub fn new(config: MarketplaceConfig) -> MarketplaceResult<Self> {
        let transport = Arc::new(ReqwestHttpTransport::with_options(
            config.timeout,
            MAX_RESPONSE_SIZE,
        )?);
        Self::with_components(
            config,
            transport,
            Arc::new(SystemClock),
            Arc::new(TokioScheduler::new()),
            Arc::new(NoOpMetrics),
        )
    }

    /// Create a client with custom implementations.
    pub fn with_components(
        config: MarketplaceConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn RefreshScheduler>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> MarketplaceResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let crypto = Arc::new(EncryptionService::from_config(Some(
            config.encryption_key.expose_secret(),
        ))?);

        let tiers = build_tiers(&config, crypto, Arc::clone(&transport), Arc::clone(&clock))?;
        let store = Arc::new(TokenStore::new(tiers, Arc::clone(&clock)).with_metrics(Arc::clone(&metrics)));

        let flow = Arc::new(AuthorizationCodeFlowImpl::new(Arc::clone(&config), transport));
        let token_manager = TokenLifecycleManager::with_metrics(
            flow,
            Arc::clone(&store),
            scheduler,
            Arc::clone(&clock),
            TokenManagerConfig::from_config(&config),
            Arc::clone(&metrics),
        );

        let rate_limiter = Arc::new(FixedWindowRateLimiter::with_metrics(
            config.rate_limits.clone(),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let executor = ResilientExecutor::new(rate_limiter, breakers, config.retry.clone())
            .with_metrics(Arc::clone(&metrics))
            .with_token_manager(token_manager.clone())
            .with_timeout(config.timeout);

        let recovery = RecoveryService::new(
            token_manager.clone(),
            Arc::clone(&store),
            clock,
            RecoveryConfig::default(),
        )
        .with_metrics(metrics);

        info!(
            environment = ?config.environment,
            tiers = store.tiers().len(),
            "Marketplace client created"
        );

        Ok(Self {
            config,
            store,
            token_manager,
            executor,
            recovery,
        })
    }

    /// Restore a stored token, refreshing it when needed.
    pub async fn initialize(&self) -> AuthState {
        self.token_manager.initialize().await
    }

    /// Consent URL carrying the anti-forgery `state`.
    pub fn authorization_url(&self, state: &str) -> MarketplaceResult<Url> {
        self.token_manager.build_authorization_url(state)
    }

    /// Complete authorization with the code from the redirect.
    pub async fn exchange_code(&self, code: &str) -> MarketplaceResult<TokenRecord> {
        self.token_manager.exchange_code(code).await
    }

    /// Run an authenticated marketplace call.
    ///
    /// The operation receives the access token. Quota, circuit breaker,
    /// retry and one refresh-and-resubmit are applied around it.
    pub async fn call<T, F, Fut>(&self, context: &CallContext, operation: F) -> MarketplaceResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = MarketplaceResult<T>>,
    {
        let result = self.executor.execute_authenticated(context, operation).await;
        if result.is_ok() {
            self.recovery.record_success(&context.endpoint_class);
        }
        result
    }

    /// Classify a failed call and apply its recovery strategy.
    pub async fn recover(&self, error: &MarketplaceError, operation: &str) -> RecoveryOutcome {
        self.recovery.handle(error, operation).await
    }

    /// Forget the token everywhere.
    pub async fn logout(&self) {
        self.token_manager.logout().await;
    }

    /// Probe every storage tier.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        self.store.health_check().await
    }

    /// Get the configuration.
    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    /// Get the token manager.
    pub fn token_manager(&self) -> &Arc<TokenLifecycleManager> {
        &self.token_manager
    }

    /// Get the token store.
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Get the call executor.
    pub fn executor(&self) -> &ResilientExecutor {
        &self.executor
    }

    /// Get the recovery service.
    pub fn recovery(&self) -> &RecoveryService {
        &self.recovery
    }
}

fn build_tiers(
    config: &MarketplaceConfig,
    crypto: Arc<EncryptionService>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
) -> MarketplaceResult<Vec<Arc<dyn StorageTier>>> {
    let dir = &config.storage_dir;
    let mut tiers: Vec<Arc<dyn StorageTier>> = vec![
        Arc::new(EncryptedStoreTier::new(
            Arc::new(FileKeyValueStore::new("encrypted-store", dir.join("secure"))),
            Arc::clone(&crypto),
            Arc::clone(&clock),
        )),
        Arc::new(SessionTier::new()),
        Arc::new(StructuredDocumentTier::new(
            Arc::new(FileKeyValueStore::new("structured-document", dir.join("documents"))),
            Arc::clone(&crypto),
            Arc::clone(&clock),
        )),
        Arc::new(LegacyFieldsTier::new(
            Arc::new(FileKeyValueStore::new("legacy-fields", dir.join("legacy"))),
            Arc::clone(&clock),
        )),
    ];

    if let Some(backup_url) = &config.backup_url {
        tiers.push(Arc::new(RemoteBackupTier::new(
            transport,
            backup_url,
            config.backup_owner.clone(),
            crypto,
            clock,
        )?));
    }
    Ok(tiers)
}

/// Create a marketplace client from environment variables.
pub fn marketplace_client_from_env() -> MarketplaceResult<MarketplaceClient> {
    MarketplaceClient::new(MarketplaceConfig::from_env()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::marketplace_config;
    use crate::core::{ManualScheduler, MockClock, MockHttpTransport};
    use crate::telemetry::InMemoryMetrics;

    struct Fixture {
        _dir: tempfile::TempDir,
        transport: Arc<MockHttpTransport>,
        metrics: Arc<InMemoryMetrics>,
        client: MarketplaceClient,
    }

    fn fixture(backup: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = marketplace_config()
            .client_id("app-id")
            .client_secret("app-secret")
            .redirect_uri("Seller_App-RuName")
            .encryption_key("0123456789abcdef0123456789abcdef")
            .storage_dir(dir.path());
        if backup {
            builder = builder.backup_url("https://backup.example.com");
        }
        let config = builder.build().unwrap();

        let transport = Arc::new(MockHttpTransport::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let client = MarketplaceClient::with_components(
            config,
            transport.clone(),
            Arc::new(MockClock::default()),
            Arc::new(ManualScheduler::new()),
            metrics.clone(),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            transport,
            metrics,
            client,
        }
    }

    #[test]
    fn test_tier_layout() {
        let names: Vec<&str> = fixture(false).client.store().tiers().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["encrypted-store", "session", "structured-document", "legacy-fields"]
        );
        assert_eq!(fixture(true).client.store().tiers().len(), 5);
    }

    #[test]
    fn test_short_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = marketplace_config()
            .client_id("app-id")
            .client_secret("app-secret")
            .redirect_uri("Seller_App-RuName")
            .encryption_key("0123456789abcdef0123456789abcdef")
            .storage_dir(dir.path())
            .build()
            .unwrap();
        let config = MarketplaceConfig {
            encryption_key: secrecy::SecretString::new("short".to_string()),
            ..config
        };

        let result = MarketplaceClient::with_components(
            config,
            Arc::new(MockHttpTransport::new()),
            Arc::new(MockClock::default()),
            Arc::new(ManualScheduler::new()),
            Arc::new(NoOpMetrics),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exchange_then_authenticated_call() {
        let f = fixture(false);
        f.transport.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "v^1.1#access",
                "expires_in": 7200,
                "refresh_token": "v^1.1#refresh",
                "token_type": "User Access Token"
            }),
        );

        f.client.exchange_code("auth-code").await.unwrap();
        assert!(f.client.token_manager().is_authenticated());

        let context = CallContext::new("seller-1", "sell");
        let header = f
            .client
            .call(&context, |token| async move { Ok(format!("Bearer {}", token)) })
            .await
            .unwrap();
        assert_eq!(header, "Bearer v^1.1#access");
        assert_eq!(f.metrics.total("marketplace_calls_total"), 1.0);

        let health = f.client.health_check().await;
        assert!(health.values().all(|healthy| *healthy));
    }

    #[tokio::test]
    async fn test_logout_then_call_requires_sign_in() {
        let f = fixture(false);
        f.transport.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "a",
                "expires_in": 7200,
                "refresh_token": "r",
                "token_type": "User Access Token"
            }),
        );
        f.client.exchange_code("auth-code").await.unwrap();
        f.client.logout().await;

        let context = CallContext::new("seller-1", "sell");
        let error = f
            .client
            .call(&context, |_token| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(error.needs_reauth());

        let outcome = f.client.recover(&error, "sell").await;
        assert!(outcome.requires_reauth);
        assert_eq!(f.client.initialize().await, AuthState::Unauthenticated);
    }
}
