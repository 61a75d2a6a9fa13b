// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime assumed when the token endpoint omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Short-lived bearer credential and the instant it stops being valid.
///
/// Token and expiry only ever exist together.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Process-wide OAuth2 credential
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub access: Option<AccessToken>,

    /// Kept across renewals unless the server hands out a new one
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn access_token(&self) -> Option<&str> {
        self.access.as_ref().map(|a| a.token.as_str())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.access.as_ref().map(|a| a.expires_at)
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh_token.is_none()
    }

    /// Access token present and not yet expired
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.access, Some(access) if now < access.expires_at)
    }

    /// Access token missing or inside the renewal skew window
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match &self.access {
            None => true,
            Some(access) => now >= access.expires_at - skew,
        }
    }
}

/// Token data produced by a successful grant
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Token endpoint success body
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth2 error body (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    pub fn describe(&self) -> String {
        match &self.error_description {
            Some(desc) => format!("{}: {}", self.error, desc),
            None => self.error.clone(),
        }
    }
}

/// Snapshot of the session exposed to the UI
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub renewable: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of probing the resource API with the current grant
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PermissionCheck {
    pub has_permission: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionCheck {
    pub fn granted() -> Self {
        Self {
            has_permission: true,
            error: None,
            message: None,
        }
    }

    pub fn denied(error: &str, message: impl Into<String>) -> Self {
        Self {
            has_permission: false,
            error: Some(error.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Token prefix safe to put in logs
pub fn preview(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential_expiring_at(expires_at: DateTime<Utc>) -> Credential {
        Credential {
            access: Some(AccessToken {
                token: "ya29.token".to_string(),
                expires_at,
            }),
            refresh_token: Some("1//refresh".to_string()),
        }
    }

    #[test]
    fn test_validity_uses_exact_expiry() {
        let now = Utc::now();
        let creds = credential_expiring_at(now + Duration::seconds(1));
        assert!(creds.is_valid_at(now));
        assert!(!creds.is_valid_at(now + Duration::seconds(1)));
        assert!(!Credential::default().is_valid_at(now));
    }

    #[test]
    fn test_renewal_window() {
        let now = Utc::now();
        let skew = Duration::seconds(300);

        // 10 minutes left, skew is 5 minutes
        let creds = credential_expiring_at(now + Duration::seconds(600));
        assert!(!creds.needs_renewal_at(now, skew));

        // 2 minutes left
        let creds = credential_expiring_at(now + Duration::seconds(120));
        assert!(creds.needs_renewal_at(now, skew));

        assert!(Credential::default().needs_renewal_at(now, skew));
    }

    #[test]
    fn test_token_response_optional_fields() {
        let data: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","token_type":"Bearer"}"#).unwrap();
        assert_eq!(data.access_token, "abc");
        assert!(data.refresh_token.is_none());
        assert!(data.expires_in.is_none());
    }

    #[test]
    fn test_oauth_error_description() {
        let body: OAuthErrorBody = serde_json::from_str(
            r#"{"error":"invalid_grant","error_description":"Bad Request"}"#,
        )
        .unwrap();
        assert_eq!(body.describe(), "invalid_grant: Bad Request");

        let body: OAuthErrorBody = serde_json::from_str(r#"{"error":"invalid_client"}"#).unwrap();
        assert_eq!(body.describe(), "invalid_client");
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("ya29.a0AfH6SMBx"), "ya29.a0A...");
        assert_eq!(preview("abc"), "abc...");
    }
}
