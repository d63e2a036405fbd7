//! Marketplace Error Types
//!
//! Error hierarchy for the authenticated marketplace client.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Root error type for the marketplace integration.
#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl MarketplaceError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "MARKETPLACE_CONFIG",
            Self::Auth(_) => "MARKETPLACE_AUTH",
            Self::Storage(_) => "MARKETPLACE_STORAGE",
            Self::Crypto(_) => "MARKETPLACE_CRYPTO",
            Self::RateLimit(_) => "MARKETPLACE_RATE_LIMIT",
            Self::Network(_) => "MARKETPLACE_NETWORK",
            Self::Api(_) => "MARKETPLACE_API",
            Self::Protocol(_) => "MARKETPLACE_PROTOCOL",
        }
    }

    /// Check if error is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_retryable(),
            Self::Api(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get server-advised retry delay if applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api(ApiError::Status { retry_after, .. }) => *retry_after,
            Self::Network(NetworkError::ServiceUnavailable { retry_in, .. }) => Some(*retry_in),
            _ => None,
        }
    }

    /// Check if error requires the user to authorize again.
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::RefreshFailed { .. })
                | Self::Auth(AuthError::NoRefreshToken)
                | Self::Auth(AuthError::NotAuthenticated)
                | Self::Auth(AuthError::ReauthorizationRequired { .. })
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(ApiError::Status { status, .. }) => Some(*status),
            Self::Auth(AuthError::ExchangeFailed { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Wrap an untyped upstream failure.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Api(ApiError::Upstream {
            status: None,
            message: message.into(),
        })
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid encryption key: {message}")]
    InvalidKey { message: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Authentication and token lifecycle error.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authorization code exchange failed ({status}): {description}")]
    ExchangeFailed {
        status: u16,
        error: Option<String>,
        description: String,
    },

    #[error("Token refresh failed: {message}")]
    RefreshFailed { message: String },

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Access token must be refreshed before calling {endpoint_class}")]
    TokenRefreshRequired { endpoint_class: String },

    #[error("Re-authorization required: {reason}")]
    ReauthorizationRequired { reason: String },
}

/// Token storage error.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read failed on {tier}: {message}")]
    ReadFailed { tier: String, message: String },

    #[error("Write failed on {tier}: {message}")]
    WriteFailed { tier: String, message: String },

    #[error("Delete failed on {tier}: {message}")]
    DeleteFailed { tier: String, message: String },

    #[error("Corrupted data in {tier}: {message}")]
    CorruptedData { tier: String, message: String },

    #[error("Storage quota exceeded on {tier}")]
    QuotaExceeded { tier: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("All storage tiers failed: {}", failures.join("; "))]
    Exhausted { failures: Vec<String> },
}

/// Encryption error.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {message}")]
    EncryptionFailed { message: String },

    #[error("Decryption failed: {message}")]
    DecryptionFailed { message: String },

    #[error("Malformed encrypted payload: {message}")]
    MalformedBlob { message: String },

    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

/// Local quota enforcement error.
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Daily quota for {endpoint_class} exhausted for {subject}, resets at {reset_at}")]
    QuotaExceeded {
        subject: String,
        endpoint_class: String,
        reset_at: DateTime<Utc>,
    },
}

/// Network/transport error.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Connection reset: {message}")]
    ConnectionReset { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Service unavailable for {endpoint_class}, circuit open")]
    ServiceUnavailable {
        endpoint_class: String,
        retry_in: Duration,
    },
}

impl NetworkError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ServiceUnavailable { .. })
    }
}

/// Error returned by the marketplace API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },
}

impl ApiError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Upstream { status, .. } => status.map_or(false, |s| s == 429 || s >= 500),
        }
    }
}

/// Protocol/response parsing error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },
}

/// Result type for marketplace operations.
pub type MarketplaceResult<T> = Result<T, MarketplaceError>;

/// OAuth error response body.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Parse an OAuth error body.
pub fn parse_error_response(body: &str) -> Option<OAuthErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Create error from an HTTP response.
pub fn create_error_from_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> MarketplaceError {
    let message = parse_error_response(body)
        .map(|r| r.error_description.unwrap_or(r.error))
        .unwrap_or_else(|| match status {
            400 => "Bad request".to_string(),
            401 => "Unauthorized".to_string(),
            403 => "Forbidden".to_string(),
            404 => "Not found".to_string(),
            429 => "Too many requests".to_string(),
            _ => format!("HTTP {}", status),
        });

    MarketplaceError::Api(ApiError::Status {
        status,
        message,
        retry_after: parse_retry_after(headers),
    })
}
