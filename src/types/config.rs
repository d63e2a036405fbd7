//! Configuration Types
//!
//! Marketplace client configuration.

use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{ConfigurationError, MarketplaceResult};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};

pub const ENV_CLIENT_ID: &str = "MARKETPLACE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "MARKETPLACE_CLIENT_SECRET";
pub const ENV_REDIRECT_URI: &str = "MARKETPLACE_REDIRECT_URI";
pub const ENV_SANDBOX: &str = "MARKETPLACE_SANDBOX";
pub const ENV_ENCRYPTION_KEY: &str = "MARKETPLACE_ENCRYPTION_KEY";
pub const ENV_STORAGE_DIR: &str = "MARKETPLACE_STORAGE_DIR";
pub const ENV_BACKUP_URL: &str = "MARKETPLACE_BACKUP_URL";
pub const ENV_BACKUP_OWNER: &str = "MARKETPLACE_BACKUP_OWNER";

/// Scopes requested during authorization and refresh.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope",
    "https://api.ebay.com/oauth/api_scope/sell.inventory",
    "https://api.ebay.com/oauth/api_scope/sell.account",
    "https://api.ebay.com/oauth/api_scope/sell.fulfillment",
];

/// Default configuration values.
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_REFRESH_LEAD_SECS: u64 = 600;
pub const DEFAULT_MIN_REFRESH_DELAY_SECS: u64 = 60;

/// Marketplace environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarketplaceEnvironment {
    #[default]
    Production,
    Sandbox,
}

impl MarketplaceEnvironment {
    /// Authorization endpoint users are redirected to.
    pub fn authorization_endpoint(&self) -> &'static str {
        match self {
            Self::Production => "https://auth.ebay.com/oauth2/authorize",
            Self::Sandbox => "https://auth.sandbox.ebay.com/oauth2/authorize",
        }
    }

    /// Token endpoint for code exchange and refresh.
    pub fn token_endpoint(&self) -> &'static str {
        match self {
            Self::Production => "https://api.ebay.com/identity/v1/oauth2/token",
            Self::Sandbox => "https://api.sandbox.ebay.com/identity/v1/oauth2/token",
        }
    }

    /// Parse a sandbox flag value.
    pub fn from_sandbox_flag(value: &str) -> MarketplaceResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Self::Sandbox),
            "0" | "false" | "no" | "off" => Ok(Self::Production),
            other => Err(ConfigurationError::InvalidConfig {
                message: format!("{} must be true or false, got {:?}", ENV_SANDBOX, other),
            }
            .into()),
        }
    }
}

/// Marketplace client configuration.
#[derive(Clone)]
pub struct MarketplaceConfig {
    /// Application client identifier.
    pub client_id: String,
    /// Application client secret.
    pub client_secret: SecretString,
    /// Redirect URI (or redirect name) registered for the application.
    pub redirect_uri: String,
    /// Production or sandbox.
    pub environment: MarketplaceEnvironment,
    /// Key material for token encryption at rest.
    pub encryption_key: SecretString,
    /// Scopes requested on authorization and refresh.
    pub scopes: Vec<String>,
    /// Directory for durable token tiers.
    pub storage_dir: PathBuf,
    /// Remote backup base URL; enables the remote tier when set.
    pub backup_url: Option<String>,
    /// Owner the remote backup entry is stored under.
    pub backup_owner: String,
    /// Override for the authorization endpoint.
    pub authorization_endpoint: Option<String>,
    /// Override for the token endpoint.
    pub token_endpoint: Option<String>,
    /// HTTP timeout.
    pub timeout: Duration,
    /// Schedule refresh this long before expiry.
    pub refresh_lead: Duration,
    /// Never schedule a refresh sooner than this.
    pub min_refresh_delay: Duration,
    /// Rate limits per endpoint class.
    pub rate_limits: RateLimitConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings.
    pub retry: RetryConfig,
}

impl MarketplaceConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> MarketplaceResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> MarketplaceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> MarketplaceResult<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ConfigurationError::MissingRequired {
                        field: name.to_string(),
                    }
                    .into()
                })
        };

        let environment = MarketplaceEnvironment::from_sandbox_flag(&required(ENV_SANDBOX)?)?;

        let mut builder = crate::builders::MarketplaceConfigBuilder::new()
            .client_id(required(ENV_CLIENT_ID)?)
            .client_secret(required(ENV_CLIENT_SECRET)?)
            .redirect_uri(required(ENV_REDIRECT_URI)?)
            .environment(environment)
            .encryption_key(required(ENV_ENCRYPTION_KEY)?);

        if let Some(dir) = lookup(ENV_STORAGE_DIR).filter(|v| !v.trim().is_empty()) {
            builder = builder.storage_dir(dir.trim());
        }
        if let Some(url) = lookup(ENV_BACKUP_URL).filter(|v| !v.trim().is_empty()) {
            builder = builder.backup_url(url.trim());
        }
        if let Some(owner) = lookup(ENV_BACKUP_OWNER).filter(|v| !v.trim().is_empty()) {
            builder = builder.backup_owner(owner.trim());
        }

        builder.build()
    }

    /// Effective authorization endpoint.
    pub fn authorization_endpoint(&self) -> &str {
        self.authorization_endpoint
            .as_deref()
            .unwrap_or_else(|| self.environment.authorization_endpoint())
    }

    /// Effective token endpoint.
    pub fn token_endpoint(&self) -> &str {
        self.token_endpoint
            .as_deref()
            .unwrap_or_else(|| self.environment.token_endpoint())
    }

    /// Space-joined scope list.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Check required fields and endpoint URLs.
    pub fn validate(&self) -> MarketplaceResult<()> {
        let missing = |field: &str| ConfigurationError::MissingRequired {
            field: field.to_string(),
        };

        if self.client_id.trim().is_empty() {
            return Err(missing("client_id").into());
        }
        if self.client_secret.expose_secret().trim().is_empty() {
            return Err(missing("client_secret").into());
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(missing("redirect_uri").into());
        }
        if self.encryption_key.expose_secret().trim().is_empty() {
            return Err(missing("encryption_key").into());
        }
        if self.scopes.is_empty() {
            return Err(missing("scopes").into());
        }

        for endpoint in [self.authorization_endpoint(), self.token_endpoint()]
            .into_iter()
            .chain(self.backup_url.as_deref())
        {
            Url::parse(endpoint).map_err(|_| ConfigurationError::InvalidEndpoint {
                url: endpoint.to_string(),
            })?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for MarketplaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketplaceConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("environment", &self.environment)
            .field("encryption_key", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("storage_dir", &self.storage_dir)
            .field("backup_url", &self.backup_url)
            .field("backup_owner", &self.backup_owner)
            .field("timeout", &self.timeout)
            .finish()
    }
}
