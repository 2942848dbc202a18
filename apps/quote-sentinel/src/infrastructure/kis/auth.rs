//! KIS Open API Authentication
//!
//! Access-token and WebSocket approval-key issuance for the KIS Open API.
//!
//! # Token Flow
//!
//! 1. `POST /oauth2/tokenP` with the app key/secret issues a bearer token
//!    valid for roughly 24 hours.
//! 2. The token is cached on disk so restarts within its lifetime do not
//!    burn the issuance quota; KIS throttles token requests per app key.
//! 3. A token is treated as expired five minutes early so in-flight
//!    requests never race the real expiry.
//!
//! The streaming connection authenticates separately: `POST /oauth2/Approval`
//! issues an approval key that is embedded in every WebSocket control frame.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::infrastructure::config::Credentials;

/// Safety margin subtracted from the token expiry.
const EXPIRY_MARGIN: Duration = Duration::seconds(300);

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token endpoint could not be reached.
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status.
    #[error("token request rejected with status {status}")]
    Rejected {
        /// HTTP status returned by the endpoint.
        status: u16,
    },

    /// The response body did not carry the expected fields.
    #[error("malformed auth response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

/// Issues and caches KIS access tokens and approval keys.
pub struct TokenManager {
    credentials: Credentials,
    base_url: String,
    cache_path: PathBuf,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    /// Create a manager, loading any still-valid token from the disk cache.
    #[must_use]
    pub fn new(credentials: Credentials, base_url: String, cache_path: PathBuf) -> Self {
        let cached = Self::load_cache(&cache_path);
        Self {
            credentials,
            base_url,
            cache_path,
            cached: Mutex::new(cached),
        }
    }

    /// A bearer token that is valid right now, refreshing if needed.
    pub async fn bearer(&self, client: &reqwest::Client) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_valid(Utc::now())
        {
            return Ok(token.access_token.clone());
        }
        let token = self.issue_token(client).await?;
        let access_token = token.access_token.clone();
        self.persist_cache(&token);
        *cached = Some(token);
        Ok(access_token)
    }

    /// Discard the cached token and issue a fresh one.
    ///
    /// Used when the upstream reports an expired or revoked token even
    /// though the local expiry had not been reached.
    pub async fn refresh(&self, client: &reqwest::Client) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        let token = self.issue_token(client).await?;
        let access_token = token.access_token.clone();
        self.persist_cache(&token);
        *cached = Some(token);
        Ok(access_token)
    }

    /// Issue a WebSocket approval key. Not cached; issued per connection.
    pub async fn ws_approval_key(&self, client: &reqwest::Client) -> Result<String, AuthError> {
        let url = format!("{}/oauth2/Approval", self.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.credentials.app_key(),
            "secretkey": self.credentials.app_secret(),
        });
        let response = client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected {
                status: response.status().as_u16(),
            });
        }
        let parsed: ApprovalResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok(parsed.approval_key)
    }

    async fn issue_token(&self, client: &reqwest::Client) -> Result<CachedToken, AuthError> {
        let url = format!("{}/oauth2/tokenP", self.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.credentials.app_key(),
            "appsecret": self.credentials.app_secret(),
        });
        let response = client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected {
                status: response.status().as_u16(),
            });
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::Malformed("empty access_token".to_string()));
        }
        let lifetime = Duration::seconds(parsed.expires_in.unwrap_or(86_400));
        tracing::info!(lifetime_secs = lifetime.num_seconds(), "issued new access token");
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + lifetime,
        })
    }

    fn load_cache(path: &PathBuf) -> Option<CachedToken> {
        let raw = std::fs::read_to_string(path).ok()?;
        let token: CachedToken = serde_json::from_str(&raw).ok()?;
        if token.is_valid(Utc::now()) {
            tracing::info!(expires_at = %token.expires_at, "reusing cached access token");
            Some(token)
        } else {
            None
        }
    }

    fn persist_cache(&self, token: &CachedToken) {
        match serde_json::to_string_pretty(token) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cache_path, json) {
                    tracing::warn!(path = %self.cache_path.display(), error = %e, "could not write token cache");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize token cache"),
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("base_url", &self.base_url)
            .field("cache_path", &self.cache_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: i64) -> CachedToken {
        CachedToken {
            access_token: "tok".to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn token_within_margin_counts_as_expired() {
        assert!(!token(200).is_valid(Utc::now()));
        assert!(token(400).is_valid(Utc::now()));
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let original = token(3600);
        std::fs::write(&path, serde_json::to_string(&original).unwrap()).unwrap();

        let loaded = TokenManager::load_cache(&path).unwrap();
        assert_eq!(loaded.access_token, original.access_token);
        assert_eq!(loaded.expires_at, original.expires_at);
    }

    #[test]
    fn expired_cache_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, serde_json::to_string(&token(-10)).unwrap()).unwrap();
        assert!(TokenManager::load_cache(&path).is_none());
    }

    #[test]
    fn missing_cache_file_is_not_an_error() {
        let path = PathBuf::from("/nonexistent/token.json");
        assert!(TokenManager::load_cache(&path).is_none());
    }
}
