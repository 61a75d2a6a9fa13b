use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;

/// Default scopes: photo library access plus basic profile
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/photoslibrary",
    "https://www.googleapis.com/auth/photoslibrary.readonly",
    "https://www.googleapis.com/auth/photoslibrary.appendonly",
    "https://www.googleapis.com/auth/photoslibrary.sharing",
    "https://www.googleapis.com/auth/photoslibrary.edit.appcreateddata",
    "https://www.googleapis.com/auth/photoslibrary.readonly.appcreateddata",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/userinfo.email",
    "openid",
];

const DEFAULT_USERINFO_URI: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const DEFAULT_API_BASE: &str = "https://photoslibrary.googleapis.com/v1";
const DEFAULT_DB_FILE: &str = "~/.local/share/album-gateway/auth.sqlite3";

/// Album Gateway - local album manager with OAuth2 session handling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// OAuth2 client id
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Redirect URI registered with the identity provider
    #[arg(long, env = "OAUTH_REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    /// Authorization endpoint
    #[arg(long, env = "OAUTH_AUTH_URI")]
    pub auth_uri: Option<String>,

    /// Token endpoint
    #[arg(long, env = "OAUTH_TOKEN_URI")]
    pub token_uri: Option<String>,

    /// Requested scopes, comma or space separated
    #[arg(long, env = "OAUTH_SCOPES")]
    pub scopes: Option<String>,

    /// OpenID userinfo endpoint
    #[arg(long, env = "OAUTH_USERINFO_URI", default_value = DEFAULT_USERINFO_URI)]
    pub userinfo_uri: String,

    /// Photo-storage API base URL
    #[arg(long, env = "PHOTOS_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Path to the SQLite auth store
    #[arg(short = 'd', long, env = "ALBUM_DB_FILE", default_value = DEFAULT_DB_FILE)]
    pub db_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Token endpoint timeout in seconds
    #[arg(long, env = "TOKEN_ENDPOINT_TIMEOUT", default_value = "30")]
    pub token_timeout: u64,

    /// Resource request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "120")]
    pub http_timeout: u64,
}

/// Raw OAuth2 settings before validation
#[derive(Debug, Clone, Default)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub scopes: Vec<String>,
    pub userinfo_endpoint: Option<String>,
}

/// Validated OAuth2 client configuration
#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub scopes: Vec<String>,
    pub userinfo_endpoint: Url,
}

impl OAuthConfig {
    /// Validate settings; every field is required
    pub fn new(settings: OAuthSettings) -> Result<Self> {
        let client_id = require(settings.client_id, "OAUTH_CLIENT_ID")?;
        let client_secret = require(settings.client_secret, "OAUTH_CLIENT_SECRET")?;
        let redirect_uri = parse_url(settings.redirect_uri, "OAUTH_REDIRECT_URI")?;
        let authorization_endpoint = parse_url(settings.authorization_endpoint, "OAUTH_AUTH_URI")?;
        let token_endpoint = parse_url(settings.token_endpoint, "OAUTH_TOKEN_URI")?;
        let userinfo_endpoint = parse_url(
            settings
                .userinfo_endpoint
                .or_else(|| Some(DEFAULT_USERINFO_URI.to_string())),
            "OAUTH_USERINFO_URI",
        )?;

        let scopes: Vec<String> = settings
            .scopes
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            anyhow::bail!("OAUTH_SCOPES must name at least one scope");
        }

        Ok(Self {
            client_id,
            client_secret,
            redirect_uri,
            authorization_endpoint,
            token_endpoint,
            scopes,
            userinfo_endpoint,
        })
    }

    /// Path of the OAuth2 callback, taken from the redirect URI
    pub fn callback_path(&self) -> &str {
        self.redirect_uri.path()
    }

    /// Origin the user agent reaches this service on
    pub fn public_origin(&self) -> Url {
        let mut origin = self.redirect_uri.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);
        origin
    }
}

/// Token lifecycle tuning
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSettings {
    /// Renew this many seconds before expiry
    pub renewal_skew_secs: u64,
    pub token_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub http_request_timeout_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            renewal_skew_secs: 300,
            token_timeout_secs: 30,
            http_connect_timeout_secs: 30,
            http_request_timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // OAuth2 client
    pub oauth: OAuthConfig,
    pub auth: AuthSettings,

    // Resource API
    pub api_base: Url,

    // Persistence
    pub db_file: PathBuf,

    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let scopes = match args.scopes.as_deref() {
            Some(raw) => parse_scopes(raw),
            None => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        let oauth = OAuthConfig::new(OAuthSettings {
            client_id: args.client_id,
            client_secret: args.client_secret,
            redirect_uri: args.redirect_uri,
            authorization_endpoint: args.auth_uri,
            token_endpoint: args.token_uri,
            scopes,
            userinfo_endpoint: Some(args.userinfo_uri),
        })?;

        let auth = AuthSettings {
            renewal_skew_secs: env_u64("TOKEN_RENEWAL_SKEW").unwrap_or(300),
            token_timeout_secs: args.token_timeout,
            http_connect_timeout_secs: env_u64("HTTP_CONNECT_TIMEOUT").unwrap_or(30),
            http_request_timeout_secs: args.http_timeout,
        };

        Ok(Config {
            server_host: args.host,
            server_port: args.port,
            oauth,
            auth,
            api_base: parse_url(Some(args.api_base), "PHOTOS_API_BASE")?,
            db_file: expand_tilde(&args.db_file),
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth.token_timeout_secs == 0 {
            anyhow::bail!("TOKEN_ENDPOINT_TIMEOUT must be greater than zero");
        }

        if self.db_file.is_dir() {
            anyhow::bail!(
                "ALBUM_DB_FILE points to a directory: {}",
                self.db_file.display()
            );
        }

        Ok(())
    }
}

fn require(value: Option<String>, name: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => anyhow::bail!("{} is required", name),
    }
}

fn parse_url(value: Option<String>, name: &str) -> Result<Url> {
    let raw = require(value, name)?;
    Url::parse(&raw).with_context(|| format!("{} is not an absolute URL: {}", name, raw))
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Split a scope list on commas and whitespace
fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
