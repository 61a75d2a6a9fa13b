// Error handling module
// Token lifecycle failures and their HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the token lifecycle.
///
/// `Clone` so one renewal outcome can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Code missing, malformed or already redeemed. No request was sent.
    #[error("Authorization code is missing, malformed or already redeemed")]
    InvalidCode,

    /// Token endpoint rejected a code exchange
    #[error("Token endpoint error: {status} - {body}")]
    TokenEndpoint { status: u16, body: String },

    /// Refresh-token exchange rejected; the session has been cleared
    #[error("Token renewal failed: {0}")]
    RenewalFailed(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Not authenticated")]
    Unauthenticated,

    /// Network-level failure (DNS, connect, reset, timeout)
    #[error("Transport error: {message}")]
    Transport { message: String, timed_out: bool },

    /// Credential store failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AuthError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        AuthError::Storage(format!("{:#}", err))
    }

    pub(crate) fn transport(err: &reqwest::Error) -> Self {
        AuthError::Transport {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Token lifecycle failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Non-success response from the photo-storage API
    #[error("Upstream API error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Auth(err) => {
                let message = err.to_string();
                match err {
                    AuthError::InvalidCode => (StatusCode::BAD_REQUEST, "invalid_code", message),
                    AuthError::TokenEndpoint { status, .. } => {
                        tracing::warn!("Token endpoint rejected request with status {}", status);
                        (StatusCode::BAD_GATEWAY, "token_endpoint_error", message)
                    }
                    AuthError::RenewalFailed(_) => {
                        (StatusCode::UNAUTHORIZED, "renewal_failed", message)
                    }
                    AuthError::NoRefreshToken | AuthError::Unauthenticated => {
                        (StatusCode::UNAUTHORIZED, "unauthenticated", message)
                    }
                    AuthError::Transport { timed_out: true, .. } => {
                        (StatusCode::GATEWAY_TIMEOUT, "transport_error", message)
                    }
                    AuthError::Transport { .. } => {
                        (StatusCode::BAD_GATEWAY, "transport_error", message)
                    }
                    AuthError::Storage(_) => {
                        tracing::error!("{}", message);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "storage_error",
                            "Credential store unavailable".to_string(),
                        )
                    }
                }
            }
            ApiError::UpstreamError { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status_code, "upstream_error", message)
            }
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Internal(err) => {
                // Log internal errors
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_error_messages() {
        let err = AuthError::TokenEndpoint {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"Token endpoint error: 400 - {"error":"invalid_grant"}"#
        );

        let err = ApiError::from(AuthError::Unauthenticated);
        assert_eq!(err.to_string(), "Not authenticated");

        let err = ApiError::UpstreamError {
            status: 429,
            message: "Quota exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream API error: 429 - Quota exceeded");
    }

    #[test]
    fn test_auth_error_statuses() {
        assert_eq!(status_of(AuthError::InvalidCode), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(AuthError::TokenEndpoint {
                status: 401,
                body: "invalid_client".to_string(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(AuthError::RenewalFailed("revoked".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_of(AuthError::NoRefreshToken), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(AuthError::Storage("locked".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transport_timeout_maps_to_gateway_timeout() {
        let timed_out = AuthError::Transport {
            message: "operation timed out".to_string(),
            timed_out: true,
        };
        assert_eq!(status_of(timed_out), StatusCode::GATEWAY_TIMEOUT);

        let reset = AuthError::Transport {
            message: "connection reset".to_string(),
            timed_out: false,
        };
        assert_eq!(status_of(reset), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_upstream_error_statuses() {
        for status in [400u16, 403, 404, 500, 503] {
            let err = ApiError::UpstreamError {
                status,
                message: "upstream".to_string(),
            };
            assert_eq!(err.into_response().status().as_u16(), status);
        }

        // Out of range falls back to 500
        let err = ApiError::UpstreamError {
            status: 1000,
            message: "Unknown error".to_string(),
        };
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_other_api_errors() {
        assert_eq!(
            status_of(ApiError::ValidationError("Missing code".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Internal(anyhow::anyhow!("Unexpected error"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::from(AuthError::InvalidCode).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "invalid_code");
        assert!(body["error"]["message"].as_str().unwrap().contains("already redeemed"));
    }
}
