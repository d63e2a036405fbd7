//! Token Types
//!
//! Token endpoint response and the token record owned by the lifecycle manager.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Tokens within this many seconds of hard expiry count as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// Token response from the authorization server.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer", sometimes "User Access Token").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: u64,
    /// Refresh token. Omitted on most refresh responses.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the refresh token in seconds.
    #[serde(default)]
    pub refresh_token_expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("refresh_token_expires_in", &self.refresh_token_expires_in)
            .finish()
    }
}

/// Access/refresh token pair with issue metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_in_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in_seconds: Option<u64>,
}

impl TokenRecord {
    /// Create record from a token response received at `now`.
    ///
    /// When the response omits a refresh token, `prior_refresh_token` is carried over.
    /// Lifetimes too large to place on the calendar are rejected.
    pub fn from_response(
        response: &TokenResponse,
        now: DateTime<Utc>,
        prior_refresh_token: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let refresh_token = response
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| prior_refresh_token.map(String::from));

        let record = Self {
            access_token: response.access_token.clone(),
            refresh_token,
            token_type: response.token_type.clone(),
            issued_at: now,
            expires_in_seconds: response.expires_in,
            refresh_expires_in_seconds: response.refresh_token_expires_in,
        };

        if record.expires_at().is_none() {
            return Err(ProtocolError::InvalidResponse {
                message: format!("expires_in out of range: {}", response.expires_in),
            });
        }
        if response.refresh_token_expires_in.is_some() && record.refresh_expires_at().is_none() {
            return Err(ProtocolError::InvalidResponse {
                message: "refresh_token_expires_in out of range".to_string(),
            });
        }
        Ok(record)
    }

    /// Hard expiry instant, `None` when it overflows the calendar.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        offset(self.issued_at, self.expires_in_seconds)
    }

    /// Whether the token is expired at `now`, including the safety margin.
    ///
    /// An unrepresentable expiry counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at() else {
            return true;
        };
        now.checked_add_signed(Duration::seconds(EXPIRY_MARGIN_SECS))
            .map_or(true, |deadline| deadline >= expires_at)
    }

    /// Non-empty access token and token type.
    pub fn is_structurally_valid(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.token_type.trim().is_empty()
    }

    /// Structurally valid and not expired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_structurally_valid() && !self.is_expired_at(now)
    }

    /// Check if has refresh token.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().map_or(false, |t| !t.is_empty())
    }

    /// Refresh token expiry, when the server reported one.
    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_expires_in_seconds
            .and_then(|secs| offset(self.issued_at, secs))
    }

    /// Whether the refresh token can still be used at `now`.
    pub fn can_refresh_at(&self, now: DateTime<Utc>) -> bool {
        if !self.has_refresh_token() {
            return false;
        }
        match self.refresh_expires_in_seconds {
            None => true,
            Some(_) => self.refresh_expires_at().map_or(false, |at| now < at),
        }
    }
}

fn offset(from: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    from.checked_add_signed(Duration::try_seconds(secs)?)
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_in_seconds", &self.expires_in_seconds)
            .field("refresh_expires_in_seconds", &self.refresh_expires_in_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_in: u64, now: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: "Bearer".to_string(),
            issued_at: now,
            expires_in_seconds: expires_in,
            refresh_expires_in_seconds: None,
        }
    }

    #[test]
    fn test_short_lived_token_is_expired() {
        let now = Utc::now();
        assert!(record(200, now).is_expired_at(now));
        assert!(!record(7200, now).is_expired_at(now));
    }

    #[test]
    fn test_expiry_margin_boundary() {
        let now = Utc::now();
        let token = record(3600, now);
        assert!(!token.is_expired_at(now + Duration::seconds(3299)));
        assert!(token.is_expired_at(now + Duration::seconds(3300)));
    }

    #[test]
    fn test_structural_validation() {
        let now = Utc::now();
        let mut token = record(7200, now);
        assert!(token.is_valid_at(now));
        token.token_type = " ".to_string();
        assert!(!token.is_valid_at(now));
    }

    #[test]
    fn test_from_response_preserves_prior_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"new","expires_in":7200}"#).unwrap();
        let now = Utc::now();
        let token = TokenRecord::from_response(&response, now, Some("old-refresh")).unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_at(), Some(now + Duration::seconds(7200)));
    }

    #[test]
    fn test_from_response_rejects_unrepresentable_lifetime() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"new","expires_in":10000000000000000}"#,
        )
        .unwrap();
        let result = TokenRecord::from_response(&response, Utc::now(), None);
        assert!(matches!(result, Err(ProtocolError::InvalidResponse { .. })));
    }

    #[test]
    fn test_overflowing_expiry_counts_as_expired() {
        let now = Utc::now();
        for expires_in in [u64::MAX, u64::MAX / 2, i64::MAX as u64] {
            let token = record(expires_in, now);
            assert_eq!(token.expires_at(), None);
            assert!(token.is_expired_at(now));
            assert!(!token.is_valid_at(now));
        }
    }

    #[test]
    fn test_refresh_window() {
        let now = Utc::now();
        let mut token = record(200, now);
        assert!(token.can_refresh_at(now + Duration::days(365)));

        token.refresh_expires_in_seconds = Some(3600);
        assert!(token.can_refresh_at(now + Duration::seconds(3599)));
        assert!(!token.can_refresh_at(now + Duration::seconds(3600)));

        token.refresh_expires_in_seconds = Some(u64::MAX);
        assert!(!token.can_refresh_at(now));

        token.refresh_token = None;
        token.refresh_expires_in_seconds = None;
        assert!(!token.can_refresh_at(now));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let output = format!("{:?}", record(7200, Utc::now()));
        assert!(!output.contains("access\""));
        assert!(!output.contains("refresh\""));
        assert!(output.contains("[REDACTED]"));
    }
}
