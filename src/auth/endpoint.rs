// Token endpoint calls: authorization-code exchange and refresh-token grant

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;

use super::types::{preview, OAuthErrorBody, TokenData, TokenResponse, DEFAULT_EXPIRES_IN_SECS};
use crate::config::OAuthConfig;

/// Why a token endpoint call produced no token
#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum EndpointFailure {
    /// Server answered with an error status or an OAuth2 error body
    #[error("{status} - {body}")]
    Rejected { status: u16, body: String },

    /// Success status but no usable token in the body
    #[error("unusable token response ({status}): {body}")]
    Malformed { status: u16, body: String },

    #[error("token endpoint timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Transport(String),
}

impl EndpointFailure {
    fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EndpointFailure::Timeout(err.to_string())
        } else {
            EndpointFailure::Transport(err.to_string())
        }
    }
}

/// Exchange an authorization code for tokens
pub(crate) async fn exchange_code(
    client: &Client,
    oauth: &OAuthConfig,
    code: &str,
    timeout: std::time::Duration,
    now: DateTime<Utc>,
) -> Result<TokenData, EndpointFailure> {
    tracing::info!("Exchanging authorization code {}", preview(code));

    let form = [
        ("code", code),
        ("client_id", oauth.client_id.as_str()),
        ("client_secret", oauth.client_secret.as_str()),
        ("redirect_uri", oauth.redirect_uri.as_str()),
        ("grant_type", "authorization_code"),
    ];

    let (status, data) = post_form(client, &oauth.token_endpoint, &form, timeout).await?;
    token_data(status, data, now)
}

/// Obtain a new access token from a refresh token
pub(crate) async fn refresh_access_token(
    client: &Client,
    oauth: &OAuthConfig,
    refresh_token: &str,
    timeout: std::time::Duration,
    now: DateTime<Utc>,
) -> Result<TokenData, EndpointFailure> {
    tracing::debug!(
        "Refresh request: url={}, client_id={}, refresh_token={}",
        oauth.token_endpoint,
        preview(&oauth.client_id),
        preview(refresh_token)
    );

    let form = [
        ("refresh_token", refresh_token),
        ("client_id", oauth.client_id.as_str()),
        ("client_secret", oauth.client_secret.as_str()),
        ("grant_type", "refresh_token"),
    ];

    let (status, data) = post_form(client, &oauth.token_endpoint, &form, timeout).await?;
    token_data(status, data, now)
}

async fn post_form(
    client: &Client,
    url: &Url,
    form: &[(&str, &str)],
    timeout: std::time::Duration,
) -> Result<(StatusCode, TokenResponse), EndpointFailure> {
    let response = client
        .post(url.clone())
        .header("Accept", "application/json")
        .form(form)
        .timeout(timeout)
        .send()
        .await
        .map_err(EndpointFailure::from_send)?;

    let status = response.status();
    let body = response.text().await.map_err(EndpointFailure::from_send)?;

    if !status.is_success() {
        tracing::error!("Token endpoint request failed: status={}, body={}", status, body);
        log_error_details(&body);
        return Err(EndpointFailure::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    parse_token_body(status, body).map(|data| (status, data))
}

/// Interpret a 2xx token endpoint body
fn parse_token_body(status: StatusCode, body: String) -> Result<TokenResponse, EndpointFailure> {
    // Some providers answer 200 with an OAuth2 error body
    if let Ok(error) = serde_json::from_str::<OAuthErrorBody>(&body) {
        tracing::error!("Token endpoint returned an error body: {}", error.describe());
        return Err(EndpointFailure::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    match serde_json::from_str::<TokenResponse>(&body) {
        Ok(data) if !data.access_token.is_empty() => Ok(data),
        Ok(_) => Err(EndpointFailure::Malformed {
            status: status.as_u16(),
            body: "response does not contain access_token".to_string(),
        }),
        Err(e) => {
            tracing::error!("Failed to parse token response: {}", e);
            Err(EndpointFailure::Malformed {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn log_error_details(body: &str) {
    if let Ok(error) = serde_json::from_str::<OAuthErrorBody>(body) {
        tracing::error!("Token endpoint error details: {}", error.describe());
    }
}

fn token_data(
    status: StatusCode,
    data: TokenResponse,
    now: DateTime<Utc>,
) -> Result<TokenData, EndpointFailure> {
    let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

    // The lifetime comes from the server; anything chrono cannot represent is unusable
    let expires_at = i64::try_from(expires_in)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            tracing::error!("Token endpoint sent an out-of-range expires_in: {}", expires_in);
            EndpointFailure::Malformed {
                status: status.as_u16(),
                body: format!("expires_in out of range: {}", expires_in),
            }
        })?;

    tracing::info!("Token issued, expires: {}", expires_at.to_rfc3339());

    Ok(TokenData {
        access_token: data.access_token,
        refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        expires_at,
    })
}
