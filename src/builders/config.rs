//! Configuration Builder
//!
//! Fluent builder for marketplace configuration.

use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigurationError, MarketplaceResult};
use crate::resilience::{CircuitBreakerConfig, EndpointLimit, RateLimitConfig, RetryConfig};
use crate::token::DEFAULT_BACKUP_OWNER;
use crate::types::{
    MarketplaceConfig, MarketplaceEnvironment, DEFAULT_MIN_REFRESH_DELAY_SECS,
    DEFAULT_REFRESH_LEAD_SECS, DEFAULT_SCOPES, DEFAULT_TIMEOUT_MS,
};

/// Marketplace configuration builder.
pub struct MarketplaceConfigBuilder {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    redirect_uri: Option<String>,
    environment: MarketplaceEnvironment,
    encryption_key: Option<SecretString>,
    scopes: Vec<String>,
    storage_dir: Option<PathBuf>,
    backup_url: Option<String>,
    backup_owner: Option<String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    timeout: Duration,
    refresh_lead: Duration,
    min_refresh_delay: Duration,
    rate_limits: RateLimitConfig,
    circuit_breaker: CircuitBreakerConfig,
    retry: RetryConfig,
}

impl Default for MarketplaceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketplaceConfigBuilder {
    /// Create new configuration builder.
    pub fn new() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            environment: MarketplaceEnvironment::Production,
            encryption_key: None,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            storage_dir: None,
            backup_url: None,
            backup_owner: None,
            authorization_endpoint: None,
            token_endpoint: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            refresh_lead: Duration::from_secs(DEFAULT_REFRESH_LEAD_SECS),
            min_refresh_delay: Duration::from_secs(DEFAULT_MIN_REFRESH_DELAY_SECS),
            rate_limits: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Set client ID.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret.
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Set redirect URI.
    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Set environment.
    pub fn environment(mut self, environment: MarketplaceEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Use the sandbox environment.
    pub fn sandbox(self, sandbox: bool) -> Self {
        self.environment(if sandbox {
            MarketplaceEnvironment::Sandbox
        } else {
            MarketplaceEnvironment::Production
        })
    }

    /// Set encryption key text (hex, base64 or raw).
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(SecretString::new(key.into()));
        self
    }

    /// Replace the scope list.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Set storage directory for durable tiers.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Enable the remote backup tier.
    pub fn backup_url(mut self, url: impl Into<String>) -> Self {
        self.backup_url = Some(url.into());
        self
    }

    /// Owner the remote backup entry is stored under.
    pub fn backup_owner(mut self, owner: impl Into<String>) -> Self {
        self.backup_owner = Some(owner.into());
        self
    }

    /// Override the authorization endpoint.
    pub fn authorization_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(endpoint.into());
        self
    }

    /// Override the token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Set request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long before expiry the scheduled refresh fires.
    pub fn refresh_lead(mut self, lead: Duration) -> Self {
        self.refresh_lead = lead;
        self
    }

    /// Set rate limit configuration.
    pub fn rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    /// Set the limit for one endpoint class.
    pub fn endpoint_limit(mut self, endpoint_class: impl Into<String>, limit: EndpointLimit) -> Self {
        self.rate_limits = self.rate_limits.with_class(endpoint_class, limit);
        self
    }

    /// Set circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Build the marketplace configuration.
    pub fn build(self) -> MarketplaceResult<MarketplaceConfig> {
        let missing = |field: &str| ConfigurationError::MissingRequired {
            field: field.to_string(),
        };

        let config = MarketplaceConfig {
            client_id: self.client_id.ok_or_else(|| missing("client_id"))?,
            client_secret: self.client_secret.ok_or_else(|| missing("client_secret"))?,
            redirect_uri: self.redirect_uri.ok_or_else(|| missing("redirect_uri"))?,
            environment: self.environment,
            encryption_key: self.encryption_key.ok_or_else(|| missing("encryption_key"))?,
            scopes: self.scopes,
            storage_dir: self
                .storage_dir
                .unwrap_or_else(|| std::env::temp_dir().join("marketplace-integration")),
            backup_url: self.backup_url,
            backup_owner: self
                .backup_owner
                .filter(|o| !o.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BACKUP_OWNER.to_string()),
            authorization_endpoint: self.authorization_endpoint,
            token_endpoint: self.token_endpoint,
            timeout: self.timeout,
            refresh_lead: self.refresh_lead,
            min_refresh_delay: self.min_refresh_delay,
            rate_limits: self.rate_limits,
            circuit_breaker: self.circuit_breaker,
            retry: self.retry,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Create a new marketplace configuration builder.
pub fn marketplace_config() -> MarketplaceConfigBuilder {
    MarketplaceConfigBuilder::new()
}
