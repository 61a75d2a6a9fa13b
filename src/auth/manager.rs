use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

use super::clock::{Clock, SystemClock};
use super::codes::{self, RedeemedCodes};
use super::credentials;
use super::endpoint::{self, EndpointFailure};
use super::location::{has_auth_params, strip_auth_params, Navigator};
use super::store::KeyValueStore;
use super::types::{preview, AccessToken, Credential, SessionStatus};
use crate::config::{AuthSettings, OAuthConfig};
use crate::error::AuthError;
use crate::http_client::RequestOptions;

type RenewalFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

/// In-flight renewal slot
enum Renewal {
    Idle,
    Renewing(RenewalFuture),
}

/// State shared with the renewal future
struct Session {
    oauth: OAuthConfig,
    credential: RwLock<Credential>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    client: Client,
    renewal_skew: chrono::Duration,
    token_timeout: std::time::Duration,
}

/// OAuth2 token lifecycle manager
/// Owns the process-wide credential: redemption, persistence, renewal and
/// the authenticated-request entry point used for every outbound call
pub struct TokenManager {
    session: Arc<Session>,

    /// At most one renewal in flight; concurrent callers share its result
    renewal: Arc<Mutex<Renewal>>,

    /// Serializes code redemption so a duplicate submit sees the first one's history
    redeem_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    /// Create a TokenManager on the wall clock, loading any persisted credential
    pub fn new(
        oauth: OAuthConfig,
        store: Arc<dyn KeyValueStore>,
        settings: &AuthSettings,
    ) -> anyhow::Result<Self> {
        Self::with_clock(oauth, store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        oauth: OAuthConfig,
        store: Arc<dyn KeyValueStore>,
        settings: &AuthSettings,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let credential = credentials::load_credential(store.as_ref())
            .context("Failed to load persisted credential")?;

        match credential.expires_at() {
            Some(expires_at) => tracing::info!(
                "Loaded persisted credential, expires: {}",
                expires_at.to_rfc3339()
            ),
            None if credential.refresh_token.is_some() => {
                tracing::info!("Loaded persisted refresh token without access token")
            }
            None => tracing::info!("No persisted credential, login required"),
        }

        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(
                settings.http_connect_timeout_secs,
            ))
            .timeout(std::time::Duration::from_secs(
                settings.http_request_timeout_secs,
            ))
            .build()
            .context("Failed to create HTTP client")?;

        let session = Session {
            oauth,
            credential: RwLock::new(credential),
            store,
            clock,
            client,
            renewal_skew: chrono::Duration::seconds(settings.renewal_skew_secs as i64),
            token_timeout: std::time::Duration::from_secs(settings.token_timeout_secs),
        };

        Ok(Self {
            session: Arc::new(session),
            renewal: Arc::new(Mutex::new(Renewal::Idle)),
            redeem_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn oauth(&self) -> &OAuthConfig {
        &self.session.oauth
    }

    /// Authorization endpoint URL for a fresh consent
    pub fn build_authorization_url(&self) -> Url {
        let oauth = &self.session.oauth;
        let mut url = oauth.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &oauth.client_id)
            .append_pair("redirect_uri", oauth.redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", &oauth.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        url
    }

    /// Fails closed: store errors count as "already redeemed"
    pub fn is_code_redeemable(&self, code: &str) -> bool {
        if !codes::is_plausible_code(code) {
            return false;
        }

        match credentials::load_redeemed_codes(self.session.store.as_ref()) {
            Ok(history) => !history.contains(code),
            Err(e) => {
                tracing::warn!("Cannot read redeemed-code history, rejecting code: {:#}", e);
                false
            }
        }
    }

    /// Exchange a single-use authorization code for a fresh credential
    pub async fn redeem_code(&self, code: &str) -> Result<Credential, AuthError> {
        let _guard = self.redeem_lock.lock().await;

        if !self.is_code_redeemable(code) {
            tracing::warn!("Rejecting authorization code {}", preview(code));
            return Err(AuthError::InvalidCode);
        }

        // A new code always supersedes the previous session
        self.session.reset().await?;

        let data = endpoint::exchange_code(
            &self.session.client,
            &self.session.oauth,
            code,
            self.session.token_timeout,
            self.session.clock.now(),
        )
        .await
        .map_err(|failure| match failure {
            EndpointFailure::Rejected { status, body }
            | EndpointFailure::Malformed { status, body } => {
                AuthError::TokenEndpoint { status, body }
            }
            EndpointFailure::Timeout(message) => AuthError::Transport {
                message,
                timed_out: true,
            },
            EndpointFailure::Transport(message) => AuthError::Transport {
                message,
                timed_out: false,
            },
        })?;

        if data.refresh_token.is_none() {
            tracing::warn!("Token endpoint issued no refresh token, session cannot be renewed");
        }

        let credential = Credential {
            access: Some(AccessToken {
                token: data.access_token,
                expires_at: data.expires_at,
            }),
            refresh_token: data.refresh_token,
        };

        let store = self.session.store.as_ref();
        {
            let mut current = self.session.credential.write().await;
            credentials::save_credential(store, &credential).map_err(AuthError::storage)?;
            *current = credential.clone();
        }

        let mut history = credentials::load_redeemed_codes(store).map_err(AuthError::storage)?;
        history.record(code);
        credentials::save_redeemed_codes(store, &history).map_err(AuthError::storage)?;

        tracing::info!("Authorization code redeemed");
        Ok(credential)
    }

    /// Access token present and not yet expired. No renewal, no I/O.
    pub async fn is_authenticated(&self) -> bool {
        let now = self.session.clock.now();
        self.session.credential.read().await.is_valid_at(now)
    }

    pub async fn session_status(&self) -> SessionStatus {
        let now = self.session.clock.now();
        let credential = self.session.credential.read().await;
        SessionStatus {
            authenticated: credential.is_valid_at(now),
            renewable: credential.refresh_token.is_some(),
            expires_at: credential.expires_at(),
        }
    }

    /// Snapshot of the in-memory credential
    pub async fn credential(&self) -> Credential {
        self.session.credential.read().await.clone()
    }

    /// Get a new access token from the refresh token.
    /// Concurrent callers join the renewal already in flight.
    pub async fn renew_access_token(&self) -> Result<String, AuthError> {
        let renewal = {
            let mut slot = lock_slot(&self.renewal);
            match &*slot {
                Renewal::Renewing(in_flight) => {
                    tracing::debug!("Joining in-flight token renewal");
                    in_flight.clone()
                }
                Renewal::Idle => {
                    let session = Arc::clone(&self.session);
                    let settled = SettleOnDrop(Arc::clone(&self.renewal));
                    let renewal = async move {
                        let _settled = settled;
                        session.renew().await
                    }
                    .boxed()
                    .shared();

                    *slot = Renewal::Renewing(renewal.clone());
                    renewal
                }
            }
        };

        renewal.await
    }

    /// Current access token, renewed first when inside the skew window
    pub async fn get_valid_access_token(&self) -> Result<String, AuthError> {
        let now = self.session.clock.now();
        let credential = self.credential().await;

        if !credential.needs_renewal_at(now, self.session.renewal_skew) {
            if let Some(token) = credential.access_token() {
                return Ok(token.to_string());
            }
        }

        if credential.refresh_token.is_none() {
            return match credential.access {
                Some(access) if now < access.expires_at => Ok(access.token),
                _ => Err(AuthError::Unauthenticated),
            };
        }

        tracing::debug!("Access token missing or expiring soon, renewing...");
        match self.renew_access_token().await {
            Ok(token) => Ok(token),
            Err(AuthError::NoRefreshToken) => Err(AuthError::Unauthenticated),
            Err(AuthError::Transport { message, timed_out }) => {
                // Network trouble: keep using the old token while it still works
                match credential.access {
                    Some(access) if self.session.clock.now() < access.expires_at => {
                        tracing::warn!(
                            "Token renewal unreachable ({}), using existing token until expiry",
                            message
                        );
                        Ok(access.token)
                    }
                    _ => Err(AuthError::Transport { message, timed_out }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Send a request with the bearer token. A 401 triggers one renewal
    /// and one resend, whose response is returned as-is.
    pub async fn authenticated_request(
        &self,
        url: Url,
        options: RequestOptions,
    ) -> Result<Response, AuthError> {
        let token = self.get_valid_access_token().await?;
        let response = self.send(&url, &options, &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(
            "Received 401 from {}, renewing token and retrying once",
            url.path()
        );

        let token = match self.renew_access_token().await {
            Ok(token) => token,
            Err(AuthError::NoRefreshToken) => return Err(AuthError::Unauthenticated),
            Err(e) => return Err(e),
        };

        self.send(&url, &options, &token).await
    }

    async fn send(
        &self,
        url: &Url,
        options: &RequestOptions,
        token: &str,
    ) -> Result<Response, AuthError> {
        let request = options.build(&self.session.client, url.clone(), token);

        tracing::debug!(method = %options.method, url = %url, "Sending authenticated request");

        let response = request.send().await.map_err(|e| {
            tracing::error!("Request to {} failed: {}", url, e);
            AuthError::transport(&e)
        })?;

        tracing::debug!(status = %response.status(), "Received response");
        Ok(response)
    }

    /// Clear credential, cached profile and code history, then drop
    /// OAuth2 redirect parameters from the current location
    pub async fn logout(&self, nav: &mut dyn Navigator) -> Result<(), AuthError> {
        self.session.reset().await?;
        credentials::clear_redeemed_codes(self.session.store.as_ref())
            .map_err(AuthError::storage)?;

        self.strip_location(nav);
        tracing::info!("Logged out");
        Ok(())
    }

    /// Reset the session and send the user agent to the authorization endpoint
    pub async fn login(&self, nav: &mut dyn Navigator) -> Result<Url, AuthError> {
        self.logout(nav).await?;

        let url = self.build_authorization_url();
        nav.assign(url.clone());
        Ok(url)
    }

    /// Like `login`, but the identity provider must prompt for consent again
    pub async fn force_reauthenticate(&self, nav: &mut dyn Navigator) -> Result<Url, AuthError> {
        self.logout(nav).await?;

        let mut url = self.build_authorization_url();
        url.query_pairs_mut().append_pair("approval_prompt", "force");
        nav.assign(url.clone());
        Ok(url)
    }

    fn strip_location(&self, nav: &mut dyn Navigator) {
        let Some(current) = nav.current() else {
            return;
        };

        // The callback still has to read these parameters
        if same_path(current.path(), self.session.oauth.callback_path()) {
            tracing::debug!("On callback path, leaving query parameters in place");
            return;
        }

        if has_auth_params(&current) {
            nav.replace(strip_auth_params(&current));
        }
    }

    pub fn redeemed_codes(&self) -> Result<RedeemedCodes, AuthError> {
        credentials::load_redeemed_codes(self.session.store.as_ref()).map_err(AuthError::storage)
    }

    pub fn cached_user_profile(&self) -> Result<Option<Value>, AuthError> {
        credentials::load_user_profile(self.session.store.as_ref()).map_err(AuthError::storage)
    }

    pub fn store_user_profile(&self, profile: &Value) -> Result<(), AuthError> {
        credentials::save_user_profile(self.session.store.as_ref(), profile)
            .map_err(AuthError::storage)
    }
}

impl Session {
    /// Drop credential and cached profile, in memory and in the store
    async fn reset(&self) -> Result<(), AuthError> {
        let mut credential = self.credential.write().await;
        *credential = Credential::default();

        let store = self.store.as_ref();
        credentials::clear_credential(store).map_err(AuthError::storage)?;
        credentials::clear_user_profile(store).map_err(AuthError::storage)?;
        Ok(())
    }

    async fn renew(&self) -> Result<String, AuthError> {
        let refresh_token = self
            .credential
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;

        tracing::info!("Renewing access token...");

        let result = endpoint::refresh_access_token(
            &self.client,
            &self.oauth,
            &refresh_token,
            self.token_timeout,
            self.clock.now(),
        )
        .await;

        let mut credential = self.credential.write().await;

        // Logout or a new login happened meanwhile
        if credential.refresh_token.as_deref() != Some(refresh_token.as_str()) {
            tracing::warn!("Session changed during renewal, discarding result");
            return Err(AuthError::Unauthenticated);
        }

        match result {
            Ok(data) => {
                let mut renewed = credential.clone();
                renewed.access = Some(AccessToken {
                    token: data.access_token.clone(),
                    expires_at: data.expires_at,
                });
                if let Some(new_refresh_token) = data.refresh_token {
                    renewed.refresh_token = Some(new_refresh_token);
                }

                credentials::save_credential(self.store.as_ref(), &renewed)
                    .map_err(AuthError::storage)?;
                *credential = renewed;

                tracing::info!("Access token renewed: {}", preview(&data.access_token));
                Ok(data.access_token)
            }
            Err(EndpointFailure::Transport(message)) => {
                tracing::error!("Token renewal transport failure: {}", message);
                Err(AuthError::Transport {
                    message,
                    timed_out: false,
                })
            }
            Err(failure) => {
                tracing::error!("Token renewal failed, clearing session: {}", failure);
                *credential = Credential::default();
                if let Err(e) = credentials::clear_credential(self.store.as_ref()) {
                    tracing::error!("Failed to clear persisted credential: {:#}", e);
                }
                Err(AuthError::RenewalFailed(failure.to_string()))
            }
        }
    }
}

/// Frees the renewal slot when the renewal future finishes or unwinds
struct SettleOnDrop(Arc<Mutex<Renewal>>);

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        *lock_slot(&self.0) = Renewal::Idle;
    }
}

fn lock_slot(slot: &Mutex<Renewal>) -> MutexGuard<'_, Renewal> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn same_path(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::location::RequestLocation;
    use crate::auth::store::MemoryStore;
    use crate::config::OAuthSettings;
    use chrono::{Duration, Utc};

    fn oauth_config() -> OAuthConfig {
        OAuthConfig::new(OAuthSettings {
            client_id: Some("client-123".to_string()),
            client_secret: Some("secret-456".to_string()),
            redirect_uri: Some("http://localhost:8000/auth/callback".to_string()),
            authorization_endpoint: Some("https://accounts.example.com/o/oauth2/auth".to_string()),
            token_endpoint: Some("https://oauth2.example.com/token".to_string()),
            scopes: vec!["openid".to_string(), "photos.readonly".to_string()],
            userinfo_endpoint: None,
        })
        .unwrap()
    }

    fn manager_with(store: MemoryStore, clock: ManualClock) -> TokenManager {
        TokenManager::with_clock(
            oauth_config(),
            Arc::new(store),
            &AuthSettings::default(),
            Arc::new(clock),
        )
        .unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_build_authorization_url() {
        let manager = manager_with(MemoryStore::new(), ManualClock::default());
        let auth_url = manager.build_authorization_url();

        assert_eq!(auth_url.host_str(), Some("accounts.example.com"));
        assert_eq!(auth_url.path(), "/o/oauth2/auth");

        let pairs: Vec<(String, String)> = auth_url.query_pairs().into_owned().collect();
        let expected = [
            ("client_id", "client-123"),
            ("redirect_uri", "http://localhost:8000/auth/callback"),
            ("response_type", "code"),
            ("scope", "openid photos.readonly"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        assert_eq!(pairs.len(), expected.len());
        for (key, value) in expected {
            assert!(
                pairs.iter().any(|(k, v)| k == key && v == value),
                "missing {}={}",
                key,
                value
            );
        }

        // Pure: same output every time
        assert_eq!(auth_url, manager.build_authorization_url());
    }

    #[test]
    fn test_code_redeemable_rules() {
        let store = MemoryStore::new();
        let manager = manager_with(store.clone(), ManualClock::default());

        assert!(!manager.is_code_redeemable(""));
        assert!(!manager.is_code_redeemable("   \t  "));
        assert!(!manager.is_code_redeemable("4/short"));
        assert!(manager.is_code_redeemable("4/0AX4XfWh-fresh"));

        let mut history = RedeemedCodes::new();
        history.record("4/0AX4XfWh-used");
        credentials::save_redeemed_codes(&store, &history).unwrap();
        assert!(!manager.is_code_redeemable("4/0AX4XfWh-used"));
    }

    #[tokio::test]
    async fn test_loads_persisted_credential() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let credential = Credential {
            access: Some(AccessToken {
                token: "ya29.persisted".to_string(),
                expires_at: clock.now() + Duration::seconds(1200),
            }),
            refresh_token: Some("1//persisted".to_string()),
        };
        credentials::save_credential(&store, &credential).unwrap();

        let manager = manager_with(store, clock.clone());
        assert!(manager.is_authenticated().await);
        assert_eq!(
            manager.get_valid_access_token().await.unwrap(),
            "ya29.persisted"
        );

        let status = manager.session_status().await;
        assert!(status.authenticated && status.renewable);
    }

    #[tokio::test]
    async fn test_is_authenticated_has_no_side_effects() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        credentials::save_credential(
            &store,
            &Credential {
                access: Some(AccessToken {
                    token: "ya29.old".to_string(),
                    expires_at: clock.now() + Duration::seconds(10),
                }),
                refresh_token: Some("1//r".to_string()),
            },
        )
        .unwrap();

        let manager = manager_with(store.clone(), clock.clone());
        clock.advance(Duration::seconds(11));

        assert!(!manager.is_authenticated().await);
        // Still there: a read never clears or renews
        assert_eq!(manager.credential().await.refresh_token.as_deref(), Some("1//r"));
        assert!(store.get(credentials::keys::ACCESS_TOKEN).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_is_unauthenticated() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        credentials::save_credential(
            &store,
            &Credential {
                access: Some(AccessToken {
                    token: "ya29.only".to_string(),
                    expires_at: clock.now() + Duration::seconds(120),
                }),
                refresh_token: None,
            },
        )
        .unwrap();

        let manager = manager_with(store, clock.clone());

        // Inside the skew window but still valid: used as-is
        assert_eq!(manager.get_valid_access_token().await.unwrap(), "ya29.only");

        clock.advance(Duration::seconds(120));
        assert_eq!(
            manager.get_valid_access_token().await,
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(
            manager.renew_access_token().await,
            Err(AuthError::NoRefreshToken)
        );
    }

    #[tokio::test]
    async fn test_logout_strips_auth_params() {
        let store = MemoryStore::new();
        let manager = manager_with(store.clone(), ManualClock::default());
        store.set(credentials::keys::USER_INFO, r#"{"id":"1"}"#).unwrap();

        let mut nav = RequestLocation::new(Some(url(
            "http://localhost:8000/albums?code=4/abc&state=s&page=2",
        )));
        tokio_test::assert_ok!(manager.logout(&mut nav).await);

        assert_eq!(
            nav.replaced().unwrap().as_str(),
            "http://localhost:8000/albums?page=2"
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_logout_keeps_params_on_callback_path() {
        let manager = manager_with(MemoryStore::new(), ManualClock::default());

        let mut nav = RequestLocation::new(Some(url(
            "http://localhost:8000/auth/callback/?code=4/abc&state=s",
        )));
        manager.logout(&mut nav).await.unwrap();
        assert!(nav.replaced().is_none());
    }

    #[tokio::test]
    async fn test_force_reauthenticate_adds_approval_prompt() {
        let manager = manager_with(MemoryStore::new(), ManualClock::default());
        let mut nav = RequestLocation::new(None);

        let login_url = manager.login(&mut nav).await.unwrap();
        assert!(!login_url.query().unwrap_or("").contains("approval_prompt"));

        let reauth_url = manager.force_reauthenticate(&mut nav).await.unwrap();
        assert!(reauth_url
            .query_pairs()
            .any(|(k, v)| k == "approval_prompt" && v == "force"));
        assert_eq!(nav.assigned(), Some(&reauth_url));
    }

    #[test]
    fn test_same_path_ignores_trailing_slash() {
        assert!(same_path("/auth/callback/", "/auth/callback"));
        assert!(!same_path("/auth/callbacks", "/auth/callback"));
    }
}
