//! Error Classifier
//!
//! Maps failures to a category, severity and recovery strategy.
//!
//! Typed error variants are mapped directly. Untyped upstream failures
//! (`ApiError`, errors raised by caller-supplied operations) are matched on
//! status and message text; this module is the only place that inspects
//! error messages.

use std::fmt;

use crate::error::{ApiError, AuthError, MarketplaceError, NetworkError};

/// Error category. Detection order follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Authentication,
    Token,
    RateLimit,
    Storage,
    Configuration,
    Server,
    Client,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Token => "token",
            Self::RateLimit => "rate_limit",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
            Self::Server => "server",
            Self::Client => "client",
            Self::Unknown => "unknown",
        }
    }

    /// Stable error code for the category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Authentication => "AUTH_ERROR",
            Self::Token => "TOKEN_ERROR",
            Self::RateLimit => "RATE_LIMIT_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::Client => "CLIENT_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Client => ErrorSeverity::Low,
            Self::Network | Self::Token | Self::RateLimit | Self::Server | Self::Unknown => {
                ErrorSeverity::Medium
            }
            Self::Authentication | Self::Storage => ErrorSeverity::High,
            Self::Configuration => ErrorSeverity::Critical,
        }
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            Self::Network | Self::RateLimit | Self::Server => RecoveryStrategy::Retry,
            Self::Authentication | Self::Token => RecoveryStrategy::RefreshToken,
            Self::Storage => RecoveryStrategy::ClearStorage,
            Self::Configuration | Self::Client => RecoveryStrategy::UserAction,
            Self::Unknown => RecoveryStrategy::Fallback,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::Server)
    }

    fn user_message(&self) -> &'static str {
        match self {
            Self::Network => "Could not reach the marketplace. Check your internet connection.",
            Self::Authentication => "Your marketplace session has ended. Please sign in again.",
            Self::Token => "Your marketplace session needs to be renewed.",
            Self::RateLimit => "Too many requests were sent. Please wait before trying again.",
            Self::Storage => "Saved sign-in data could not be read or written.",
            Self::Configuration => "The marketplace integration is not configured correctly.",
            Self::Server => "The marketplace is having problems. Please try again shortly.",
            Self::Client => "The marketplace rejected the request.",
            Self::Unknown => "Something unexpected went wrong.",
        }
    }

    fn suggested_actions(&self) -> &'static [&'static str] {
        match self {
            Self::Network => &[
                "Check your internet connection",
                "Try again in a few moments",
            ],
            Self::Authentication => &[
                "Sign in to your marketplace account again",
                "Confirm the application is still authorized",
            ],
            Self::Token => &["Retry the request", "Sign in again if the problem persists"],
            Self::RateLimit => &[
                "Wait a few minutes before retrying",
                "Reduce the number of requests",
            ],
            Self::Storage => &[
                "Free up disk space",
                "Check file permissions for the storage directory",
                "Sign in again",
            ],
            Self::Configuration => &[
                "Check the client ID, client secret and redirect URI",
                "Set a valid encryption key",
            ],
            Self::Server => &["Try again in a few minutes"],
            Self::Client => &["Check the request data and try again"],
            Self::Unknown => &["Try again", "Sign in again if the problem persists"],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStrategy {
    Retry,
    RefreshToken,
    Reauth,
    ClearStorage,
    Fallback,
    UserAction,
}

/// Classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub code: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recovery_strategy: RecoveryStrategy,
    pub user_message: String,
    pub suggested_actions: Vec<String>,
    pub technical_detail: String,
}

impl ClassifiedError {
    fn new(category: ErrorCategory, technical_detail: String) -> Self {
        Self {
            code: category.code().to_string(),
            category,
            severity: category.severity(),
            retryable: category.is_retryable(),
            recovery_strategy: category.strategy(),
            user_message: category.user_message().to_string(),
            suggested_actions: category
                .suggested_actions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            technical_detail,
        }
    }
}

const NETWORK_SIGNATURES: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "econnreset",
    "econnrefused",
    "enotfound",
    "socket hang up",
    "dns",
    "fetch failed",
];

const AUTH_SIGNATURES: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "not authenticated",
    "authentication",
    "credential",
];

const TOKEN_SIGNATURES: &[&str] = &["token", "expired", "expiry", "refresh"];

const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "call limit",
    "request limit",
    "daily limit",
    "throttl",
];

const STORAGE_SIGNATURES: &[&str] = &[
    "storage",
    "quotaexceeded",
    "quota_exceeded",
    "permission denied",
    "no space",
    "disk full",
    "read-only file system",
];

const CONFIGURATION_SIGNATURES: &[&str] = &[
    "missing",
    "undefined",
    "invalid_client",
    "invalid client",
    "not configured",
    "configuration",
];

const SERVER_SIGNATURES: &[&str] = &[
    "internal server error",
    "service unavailable",
    "bad gateway",
];

fn matches_any(message: &str, signatures: &[&str]) -> bool {
    signatures.iter().any(|s| message.contains(s))
}

/// Categorize an untyped failure from its status and message, first match wins.
pub fn categorize(status: Option<u16>, message: &str) -> ErrorCategory {
    let message = message.to_lowercase();

    if matches_any(&message, NETWORK_SIGNATURES) {
        ErrorCategory::Network
    } else if status == Some(401) || matches_any(&message, AUTH_SIGNATURES) {
        ErrorCategory::Authentication
    } else if matches_any(&message, TOKEN_SIGNATURES) {
        ErrorCategory::Token
    } else if status == Some(429) || matches_any(&message, RATE_LIMIT_SIGNATURES) {
        ErrorCategory::RateLimit
    } else if matches_any(&message, STORAGE_SIGNATURES) {
        ErrorCategory::Storage
    } else if matches_any(&message, CONFIGURATION_SIGNATURES) {
        ErrorCategory::Configuration
    } else if status.map_or(false, |s| s >= 500) || matches_any(&message, SERVER_SIGNATURES) {
        ErrorCategory::Server
    } else if status.map_or(false, |s| (400..500).contains(&s)) {
        ErrorCategory::Client
    } else {
        ErrorCategory::Unknown
    }
}

/// Category of a typed error.
pub fn category_of(error: &MarketplaceError) -> ErrorCategory {
    match error {
        MarketplaceError::Network(NetworkError::ServiceUnavailable { .. }) => ErrorCategory::Server,
        MarketplaceError::Network(_) => ErrorCategory::Network,
        MarketplaceError::Auth(AuthError::RefreshFailed { .. })
        | MarketplaceError::Auth(AuthError::TokenRefreshRequired { .. }) => ErrorCategory::Token,
        MarketplaceError::Auth(_) => ErrorCategory::Authentication,
        MarketplaceError::RateLimit(_) => ErrorCategory::RateLimit,
        MarketplaceError::Storage(_) | MarketplaceError::Crypto(_) => ErrorCategory::Storage,
        MarketplaceError::Configuration(_) => ErrorCategory::Configuration,
        MarketplaceError::Api(ApiError::Status {
            status, message, ..
        }) => categorize(Some(*status), message),
        MarketplaceError::Api(ApiError::Upstream { status, message }) => {
            categorize(*status, message)
        }
        MarketplaceError::Protocol(_) => ErrorCategory::Unknown,
    }
}

/// Whether a rate-limit failure names a daily or quota exhaustion.
pub fn is_quota_exhaustion(error: &MarketplaceError) -> bool {
    if matches!(error, MarketplaceError::RateLimit(_)) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    message.contains("daily") || message.contains("quota")
}

/// Upstream API failures keep the message as received; everything else
/// uses its display form.
fn technical_detail(error: &MarketplaceError) -> String {
    match error {
        MarketplaceError::Api(ApiError::Status { message, .. })
        | MarketplaceError::Api(ApiError::Upstream { message, .. }) => message.clone(),
        other => other.to_string(),
    }
}

/// Error classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create new classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classify a typed error.
    pub fn classify(&self, error: &MarketplaceError) -> ClassifiedError {
        ClassifiedError::new(category_of(error), technical_detail(error))
    }

    /// Classify an untyped failure described by status and message.
    pub fn classify_message(&self, status: Option<u16>, message: &str) -> ClassifiedError {
        ClassifiedError::new(categorize(status, message), message.to_string())
    }
}
