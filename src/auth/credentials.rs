// Credential persistence on top of the key-value store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::codes::RedeemedCodes;
use super::store::KeyValueStore;
use super::types::{AccessToken, Credential};

/// Storage keys
pub mod keys {
    pub const ACCESS_TOKEN: &str = "album:oauth:access_token";
    pub const REFRESH_TOKEN: &str = "album:oauth:refresh_token";
    /// Epoch milliseconds
    pub const TOKEN_EXPIRY: &str = "album:oauth:token_expiry";
    pub const USER_INFO: &str = "album:oauth:user_info";
    pub const PROCESSED_CODES: &str = "album:oauth:processed_codes";
}

/// Load the persisted credential.
/// An access token without a readable expiry (or the reverse) is dropped.
pub fn load_credential(store: &dyn KeyValueStore) -> Result<Credential> {
    let access_token = store.get(keys::ACCESS_TOKEN)?;
    let refresh_token = store.get(keys::REFRESH_TOKEN)?;
    let expiry = store.get(keys::TOKEN_EXPIRY)?;

    let access = match (access_token, expiry.as_deref().and_then(parse_expiry)) {
        (Some(token), Some(expires_at)) if !token.is_empty() => {
            Some(AccessToken { token, expires_at })
        }
        (None, None) => None,
        _ => {
            tracing::warn!("Discarding half-persisted access token (token/expiry mismatch)");
            None
        }
    };

    Ok(Credential {
        access,
        refresh_token: refresh_token.filter(|t| !t.is_empty()),
    })
}

/// Persist the credential, removing keys for absent fields
pub fn save_credential(store: &dyn KeyValueStore, credential: &Credential) -> Result<()> {
    match &credential.access {
        Some(access) => {
            store.set(keys::ACCESS_TOKEN, &access.token)?;
            store.set(
                keys::TOKEN_EXPIRY,
                &access.expires_at.timestamp_millis().to_string(),
            )?;
        }
        None => {
            store.delete(keys::ACCESS_TOKEN)?;
            store.delete(keys::TOKEN_EXPIRY)?;
        }
    }

    match &credential.refresh_token {
        Some(refresh_token) => store.set(keys::REFRESH_TOKEN, refresh_token)?,
        None => store.delete(keys::REFRESH_TOKEN)?,
    }

    Ok(())
}

pub fn clear_credential(store: &dyn KeyValueStore) -> Result<()> {
    store.delete(keys::ACCESS_TOKEN)?;
    store.delete(keys::TOKEN_EXPIRY)?;
    store.delete(keys::REFRESH_TOKEN)?;
    Ok(())
}

/// Load the redeemed-code history. A corrupt entry reads as empty.
pub fn load_redeemed_codes(store: &dyn KeyValueStore) -> Result<RedeemedCodes> {
    let Some(raw) = store.get(keys::PROCESSED_CODES)? else {
        return Ok(RedeemedCodes::new());
    };

    match serde_json::from_str::<RedeemedCodes>(&raw) {
        Ok(codes) => Ok(codes.normalize()),
        Err(e) => {
            tracing::warn!("Ignoring unreadable redeemed-code history: {}", e);
            Ok(RedeemedCodes::new())
        }
    }
}

pub fn save_redeemed_codes(store: &dyn KeyValueStore, codes: &RedeemedCodes) -> Result<()> {
    let json = serde_json::to_string(codes).context("Failed to serialize redeemed codes")?;
    store.set(keys::PROCESSED_CODES, &json)
}

pub fn clear_redeemed_codes(store: &dyn KeyValueStore) -> Result<()> {
    store.delete(keys::PROCESSED_CODES)
}

pub fn load_user_profile(store: &dyn KeyValueStore) -> Result<Option<Value>> {
    let Some(raw) = store.get(keys::USER_INFO)? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(profile) => Ok(Some(profile)),
        Err(e) => {
            tracing::warn!("Ignoring unreadable cached user profile: {}", e);
            Ok(None)
        }
    }
}

pub fn save_user_profile(store: &dyn KeyValueStore, profile: &Value) -> Result<()> {
    let json = serde_json::to_string(profile).context("Failed to serialize user profile")?;
    store.set(keys::USER_INFO, &json)
}

pub fn clear_user_profile(store: &dyn KeyValueStore) -> Result<()> {
    store.delete(keys::USER_INFO)
}

/// Parse an epoch-millisecond expiry
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
