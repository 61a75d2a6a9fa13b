// Navigable location seen by the user agent

use axum::http::Uri;
use reqwest::Url;

/// Query parameters that belong to an OAuth2 redirect
pub const AUTH_QUERY_PARAMS: [&str; 4] = ["code", "state", "error", "error_description"];

/// Where the user agent currently is, and how to move it
pub trait Navigator: Send {
    fn current(&self) -> Option<Url>;

    /// Rewrite the location in place, without a reload
    fn replace(&mut self, url: Url);

    /// Send the user agent somewhere else
    fn assign(&mut self, url: Url);
}

pub fn has_auth_params(url: &Url) -> bool {
    url.query_pairs()
        .any(|(key, _)| AUTH_QUERY_PARAMS.contains(&key.as_ref()))
}

/// Copy of `url` without the OAuth2 redirect parameters; other parameters are kept
pub fn strip_auth_params(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !AUTH_QUERY_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

/// Location of a single HTTP request, recording what the handler asked for
#[derive(Debug, Clone, Default)]
pub struct RequestLocation {
    current: Option<Url>,
    replaced: Option<Url>,
    assigned: Option<Url>,
}

impl RequestLocation {
    pub fn new(current: Option<Url>) -> Self {
        Self {
            current,
            replaced: None,
            assigned: None,
        }
    }

    /// Resolve a request URI against the public origin of the service
    pub fn from_request(origin: &Url, uri: &Uri) -> Self {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        match origin.join(path_and_query) {
            Ok(url) => Self::new(Some(url)),
            Err(e) => {
                tracing::debug!("Unresolvable request location {}: {}", uri, e);
                Self::new(None)
            }
        }
    }

    pub fn replaced(&self) -> Option<&Url> {
        self.replaced.as_ref()
    }

    pub fn assigned(&self) -> Option<&Url> {
        self.assigned.as_ref()
    }
}

impl Navigator for RequestLocation {
    fn current(&self) -> Option<Url> {
        self.replaced.clone().or_else(|| self.current.clone())
    }

    fn replace(&mut self, url: Url) {
        self.replaced = Some(url);
    }

    fn assign(&mut self, url: Url) {
        self.assigned = Some(url);
    }
}
