// CORS and request logging middleware

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Request logging middleware
///
/// Logs method, path, status and latency. Query strings are left out
/// because the OAuth2 callback carries the authorization code there.
pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() {
        tracing::warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "Request failed"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "Request completed"
        );
    }

    response
}

/// Create CORS middleware layer
///
/// Only the service's own origin may read responses cross-origin; `/api`
/// answers carry the user's photo library. Handles OPTIONS preflight
/// requests automatically.
pub fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let allow_origin = match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(e) => {
            tracing::warn!("Invalid CORS origin {:?}, cross-origin reads disabled: {}", allowed_origin, e);
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
