//! Marketplace Integration
//!
//! Resilient, OAuth-authenticated client core for a rate-limited marketplace API.
//!
//! # Features
//!
//! - Authorization-code grant with refresh-token renewal scheduled ahead of expiry
//! - Single-flight token refresh with change notifications
//! - Five-tier redundant token storage with AES-256-GCM encryption and self-healing reads
//! - Per-subject, per-endpoint-class daily quotas with request pacing
//! - One circuit breaker per endpoint class
//! - Exponential backoff with full jitter and `Retry-After` handling
//! - Error classification with category-specific recovery
//!
//! # Example
//!
//! ```rust,ignore
//! use marketplace_integration::{marketplace_config, CallContext, MarketplaceClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = marketplace_config()
//!         .client_id("my-app-id")
//!         .client_secret("my-cert-id")
//!         .redirect_uri("My_App-RuName")
//!         .encryption_key(std::env::var("MARKETPLACE_ENCRYPTION_KEY")?)
//!         .sandbox(true)
//!         .build()?;
//!
//!     let client = MarketplaceClient::new(config)?;
//!     client.initialize().await;
//!
//!     println!("Authorize at: {}", client.authorization_url("csrf-state")?);
//!
//!     let context = CallContext::new("seller-1", "sell");
//!     let listings = client
//!         .call(&context, |access_token| async move {
//!             fetch_listings(&access_token).await
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: token records and configuration
//! - `error`: error hierarchy and HTTP error mapping
//! - `core`: HTTP transport, clock and refresh scheduler seams
//! - `crypto`: encryption of token material at rest
//! - `flows`: authorization URL and token endpoint calls
//! - `token`: storage tiers, token store and token lifecycle manager
//! - `resilience`: rate limiter, circuit breakers, retry and the call executor
//! - `recovery`: error classification and recovery strategies
//! - `telemetry`: metrics
//! - `builders`: fluent configuration builder
//! - `client`: composition root

pub mod builders;
pub mod client;
pub mod core;
pub mod crypto;
pub mod error;
pub mod flows;
pub mod recovery;
pub mod resilience;
pub mod telemetry;
pub mod token;
pub mod types;

// Re-export main client
pub use client::{marketplace_client_from_env, MarketplaceClient};

// Re-export builders
pub use builders::{marketplace_config, MarketplaceConfigBuilder};

// Re-export errors
pub use error::{
    create_error_from_response, parse_error_response, parse_retry_after,
    ApiError, AuthError, ConfigurationError, CryptoError, MarketplaceError, MarketplaceResult,
    NetworkError, OAuthErrorResponse, ProtocolError, RateLimitError, StorageError,
};

// Re-export types
pub use types::{
    MarketplaceConfig, MarketplaceEnvironment, TokenRecord, TokenResponse, DEFAULT_SCOPES,
    EXPIRY_MARGIN_SECS,
};

// Re-export core components
pub use core::{
    // Transport
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport,
    ReqwestHttpTransport,
    // Clock
    Clock, MockClock, SystemClock,
    // Scheduler
    ManualScheduler, RefreshScheduler, ScheduleHandle, TokioScheduler,
};

// Re-export crypto
pub use crypto::{EncryptedBlob, EncryptionKey, EncryptionService};

// Re-export flows
pub use flows::{AuthorizationCodeFlow, AuthorizationCodeFlowImpl, MockAuthorizationCodeFlow};

// Re-export token management
pub use token::{
    // Backends
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, MockKeyValueStore,
    // Tiers
    StorageTier, TierDescriptor,
    // Store
    TokenStore,
    // Manager
    AuthState, MockTokenManager, TokenLifecycleManager, TokenManager, TokenManagerConfig,
};

// Re-export resilience
pub use resilience::{
    // Retry
    RetryConfig, DEFAULT_RETRY_CONFIG,
    // Circuit Breaker
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, EndpointCircuitBreaker,
    DEFAULT_CIRCUIT_BREAKER_CONFIG,
    // Rate Limiter
    create_mock_rate_limiter, create_rate_limiter, EndpointLimit, FixedWindowRateLimiter,
    MockRateLimiter, RateLimitConfig, RateLimiter, RateLimiterStats,
    // Executor
    CallContext, ResilientExecutor,
};

// Re-export recovery
pub use recovery::{
    ClassifiedError, ErrorCategory, ErrorClassifier, ReauthSignal, RecoveryOutcome,
    RecoveryService, RecoveryStrategy,
};

// Re-export telemetry
pub use telemetry::{
    create_in_memory_metrics, no_op_metrics, ClientMetrics, InMemoryMetrics, MetricEntry,
    NoOpMetrics,
};
