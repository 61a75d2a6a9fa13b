use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{PermissionCheck, TokenManager};
use crate::error::ApiError;

/// Headers never forwarded to the photo-storage API
const SKIPPED_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "cookie",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Caller-side description of an authenticated request.
///
/// The body is kept as `Bytes` so the request can be rebuilt for the
/// single retry after a 401.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(mut self, value: &Value) -> Self {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    /// Assemble the request: caller headers kept, JSON content type by
    /// default, bearer token replacing any caller Authorization header
    pub(crate) fn build(&self, client: &Client, url: Url, token: &str) -> RequestBuilder {
        let mut headers = self.headers.clone();
        headers.remove(header::AUTHORIZATION);

        if self.body.is_some() && !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        let mut request = client
            .request(self.method.clone(), url)
            .headers(headers)
            .bearer_auth(token);

        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        request
    }
}

/// Photo-storage API client
/// Every call goes through the TokenManager's authenticated request
pub struct PhotosClient {
    tokens: Arc<TokenManager>,
    api_base: Url,
}

impl PhotosClient {
    pub fn new(tokens: Arc<TokenManager>, api_base: Url) -> Self {
        Self { tokens, api_base }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Resolve a resource path below the API base
    pub fn resource_url(&self, path: &str, query: Option<&str>) -> Result<Url, ApiError> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(ApiError::ValidationError(format!(
                "Invalid resource path: {}",
                path
            )));
        }

        let mut url = self.api_base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    /// Fetch the OpenID profile and cache it
    pub async fn fetch_user_profile(&self) -> Result<Value, ApiError> {
        let url = self.tokens.oauth().userinfo_endpoint.clone();
        let response = self
            .tokens
            .authenticated_request(url, RequestOptions::get())
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                response_body = %error_text,
                "Failed to fetch user profile"
            );
            return Err(ApiError::UpstreamError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let profile: Value = response
            .json()
            .await
            .context("Failed to parse user profile")?;
        self.tokens.store_user_profile(&profile)?;

        tracing::debug!("User profile cached");
        Ok(profile)
    }

    /// Probe the album listing to see whether the grant covers the library
    pub async fn check_permissions(&self) -> PermissionCheck {
        let url = match self.resource_url("albums", Some("pageSize=1")) {
            Ok(url) => url,
            Err(e) => return PermissionCheck::denied("unknown", e.to_string()),
        };

        match self
            .tokens
            .authenticated_request(url, RequestOptions::get())
            .await
        {
            Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                let error_text = response.text().await.unwrap_or_default();
                tracing::warn!(response_body = %error_text, "Permission probe rejected");
                PermissionCheck::denied(
                    "insufficient_scopes",
                    "The granted scopes do not cover the photo library",
                )
            }
            Ok(_) => PermissionCheck::granted(),
            Err(e) => {
                tracing::warn!("Permission probe failed: {}", e);
                PermissionCheck::denied("unknown", format!("Could not verify permissions: {}", e))
            }
        }
    }

    /// Relay a resource call, authenticated with the current session
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ApiError> {
        let url = self.resource_url(path, query)?;

        let mut options = RequestOptions::new(method);
        for (name, value) in headers {
            if !SKIPPED_HEADERS.contains(&name.as_str()) {
                options.headers.append(name.clone(), value.clone());
            }
        }
        if !body.is_empty() {
            options.body = Some(body);
        }

        tracing::debug!(method = %options.method, url = %url, "Forwarding resource request");
        Ok(self.tokens.authenticated_request(url, options).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_of(request: &reqwest::Request, name: HeaderName) -> Vec<String> {
        request
            .headers()
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_build_merges_caller_headers() {
        let options = RequestOptions::new(Method::POST)
            .header(
                HeaderName::from_static("x-goog-upload-protocol"),
                HeaderValue::from_static("raw"),
            )
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer stale"))
            .body(r#"{"album":{"title":"Trip"}}"#);

        let request = options
            .build(
                &Client::new(),
                Url::parse("https://photos.example.com/v1/albums").unwrap(),
                "ya29.fresh",
            )
            .build()
            .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            header_of(&request, header::AUTHORIZATION),
            vec!["Bearer ya29.fresh"]
        );
        assert_eq!(
            header_of(&request, HeaderName::from_static("x-goog-upload-protocol")),
            vec!["raw"]
        );
        assert_eq!(
            header_of(&request, header::CONTENT_TYPE),
            vec!["application/json"]
        );
    }

    #[test]
    fn test_build_keeps_caller_content_type() {
        let options = RequestOptions::new(Method::POST)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(vec![0u8, 1, 2]);

        let request = options
            .build(
                &Client::new(),
                Url::parse("https://photos.example.com/v1/uploads").unwrap(),
                "t",
            )
            .build()
            .unwrap();

        assert_eq!(
            header_of(&request, header::CONTENT_TYPE),
            vec!["application/octet-stream"]
        );
    }

    #[test]
    fn test_get_without_body_has_no_content_type() {
        let request = RequestOptions::get()
            .build(
                &Client::new(),
                Url::parse("https://photos.example.com/v1/albums").unwrap(),
                "t",
            )
            .build()
            .unwrap();

        assert!(request.headers().get(header::CONTENT_TYPE).is_none());
        assert!(request.body().is_none());
    }

    #[test]
    fn test_json_helper() {
        let options = RequestOptions::new(Method::POST).json(&serde_json::json!({"pageSize": 50}));
        assert_eq!(options.body.as_deref(), Some(&br#"{"pageSize":50}"#[..]));
        assert_eq!(
            options.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
