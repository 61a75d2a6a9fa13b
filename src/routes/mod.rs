use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, Method, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{preview, PermissionCheck, RequestLocation, SessionStatus, TokenManager};
use crate::error::{ApiError, AuthError};
use crate::http_client::PhotosClient;
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenManager>,
    pub photos: Arc<PhotosClient>,
}

impl AppState {
    pub fn new(tokens: Arc<TokenManager>, photos: Arc<PhotosClient>) -> Self {
        Self { tokens, photos }
    }

    /// Location of this request as the user agent sees it
    fn location(&self, uri: &Uri) -> RequestLocation {
        RequestLocation::from_request(&self.tokens.oauth().public_origin(), uri)
    }
}

/// Query parameters delivered to the OAuth2 callback
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    #[serde(default)]
    pub refresh: bool,
}

/// Build the application with all routes and middleware
pub fn build_app(state: AppState) -> Router {
    let origin = state
        .tokens
        .oauth()
        .public_origin()
        .origin()
        .ascii_serialization();

    Router::new()
        .merge(health_routes())
        .merge(auth_routes(state.clone()))
        .merge(api_routes(state))
        .layer(middleware::cors_layer(&origin))
        .layer(axum::middleware::from_fn(middleware::request_logging))
}

/// Health check routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Session routes: login, callback, logout and status
pub fn auth_routes(state: AppState) -> Router {
    let callback_path = state.tokens.oauth().callback_path().to_string();

    Router::new()
        .route("/auth/login", get(login_handler))
        .route("/auth/reauthenticate", get(reauthenticate_handler))
        .route(&callback_path, get(callback_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/status", get(status_handler))
        .route("/auth/profile", get(profile_handler))
        .route("/auth/permissions", get(permissions_handler))
        .with_state(state)
}

/// Photo-storage API pass-through
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/*path", any(proxy_handler))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Album Gateway is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /auth/login - Start the authorization-code flow
async fn login_handler(State(state): State<AppState>, uri: Uri) -> Result<Redirect, ApiError> {
    let mut location = state.location(&uri);
    let url = state.tokens.login(&mut location).await?;

    tracing::info!("Redirecting to authorization endpoint");
    Ok(Redirect::to(url.as_str()))
}

/// GET /auth/reauthenticate - Login that forces the consent screen
async fn reauthenticate_handler(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Redirect, ApiError> {
    let mut location = state.location(&uri);
    let url = state.tokens.force_reauthenticate(&mut location).await?;

    tracing::info!("Redirecting to authorization endpoint with forced consent");
    Ok(Redirect::to(url.as_str()))
}

/// GET {callback} - Redeem the authorization code delivered by the identity provider
async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, ApiError> {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        tracing::warn!("Authorization denied: {} {}", error, description);
        return Err(ApiError::ValidationError(format!(
            "Authorization failed: {} {}",
            error, description
        )
        .trim_end()
        .to_string()));
    }

    let code = params
        .code
        .ok_or_else(|| ApiError::ValidationError("Missing authorization code".to_string()))?;

    tracing::info!(
        "Authorization callback received (code: {}, state: {})",
        preview(&code),
        params.state.as_deref().unwrap_or("-")
    );

    state.tokens.redeem_code(&code).await?;

    // Profile is a convenience; the session is usable without it
    if let Err(e) = state.photos.fetch_user_profile().await {
        tracing::warn!("Could not fetch user profile after login: {}", e);
    }

    Ok(Redirect::to("/"))
}

/// POST /auth/logout - Drop the session
async fn logout_handler(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<Value>, ApiError> {
    let mut location = state.location(&uri);
    state.tokens.logout(&mut location).await?;

    Ok(Json(json!({
        "status": "logged_out",
        "location": location.replaced().map(|url| url.as_str().to_string()),
    })))
}

/// GET /auth/status - Session state without side effects
async fn status_handler(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.tokens.session_status().await)
}

/// GET /auth/profile - Cached user profile, fetched on first use or `?refresh=true`
async fn profile_handler(
    State(state): State<AppState>,
    Query(params): Query<ProfileParams>,
) -> Result<Json<Value>, ApiError> {
    if !params.refresh {
        if let Some(profile) = state.tokens.cached_user_profile()? {
            return Ok(Json(profile));
        }
    }

    Ok(Json(state.photos.fetch_user_profile().await?))
}

/// GET /auth/permissions - Probe whether the grant covers the photo library
async fn permissions_handler(State(state): State<AppState>) -> Json<PermissionCheck> {
    Json(state.photos.check_permissions().await)
}

/// ANY /api/*path - Forward to the photo-storage API with the session token
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let upstream = state
        .photos
        .forward(method, &path, query.as_deref(), &headers, body)
        .await?;

    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let body = upstream
        .bytes()
        .await
        .map_err(|e| ApiError::Auth(AuthError::transport(&e)))?;

    if !status.is_success() {
        tracing::debug!(status = status.as_u16(), path = %path, "Upstream returned error status");
    }

    let mut response = (status, body).into_response();
    match content_type {
        Some(value) => {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        None => {
            response.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    Ok(response)
}
