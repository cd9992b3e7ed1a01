//! Refresh-token session against the auth service.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::RwLock;
use tokio::time::Instant;

use huddle_core::errors::{Error, Result as CoreResult};
use huddle_core::sync::SessionProvider;

use crate::error::{Result, SyncClientError};
use crate::types::{AuthErrorResponse, TokenResponse};

/// Seconds before actual expiry to treat a cached token as expired.
const TOKEN_EXPIRY_BUFFER_SECS: u64 = 60;
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;
const REFRESH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
struct CachedAccessToken {
    token: String,
    expires_at: Instant,
}

/// Exchanges a refresh token for short-lived access tokens and caches them.
///
/// The auth service rotates the refresh token on every exchange; the newest
/// one is kept in memory and readable through [`current_refresh_token`].
///
/// [`current_refresh_token`]: RefreshTokenSession::current_refresh_token
pub struct RefreshTokenSession {
    client: reqwest::Client,
    auth_url: String,
    api_key: Option<String>,
    refresh_token: RwLock<String>,
    cache: RwLock<Option<CachedAccessToken>>,
}

impl RefreshTokenSession {
    pub fn new(auth_url: &str, api_key: Option<String>, refresh_token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            auth_url: auth_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            refresh_token: RwLock::new(refresh_token),
            cache: RwLock::new(None),
        })
    }

    pub async fn current_refresh_token(&self) -> String {
        self.refresh_token.read().await.clone()
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse> {
        let token_url = format!("{}/auth/v1/token?grant_type=refresh_token", self.auth_url);
        debug!("[Session] Refreshing access token");

        let mut request = self
            .client
            .post(&token_url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<AuthErrorResponse>(&body)
                .ok()
                .and_then(|err| err.error_description.or(err.error))
                .unwrap_or_else(|| body.clone());
            error!(
                "[Session] Token refresh failed with status {}: {}",
                status, message
            );
            if status.is_server_error() {
                return Err(SyncClientError::api(status.as_u16(), message));
            }
            return Err(SyncClientError::auth(format!(
                "Session expired. Please sign in again. ({})",
                message
            )));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SessionProvider for RefreshTokenSession {
    async fn access_token(&self) -> CoreResult<String> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        // Held across the exchange: refresh tokens are single-use.
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let refresh_token = self.refresh_token.read().await.clone();
        if refresh_token.trim().is_empty() {
            return Err(Error::Session(
                "No refresh token configured. Please sign in first.".to_string(),
            ));
        }

        let response = self.exchange(&refresh_token).await?;
        if let Some(rotated) = response.refresh_token.filter(|t| !t.is_empty()) {
            *self.refresh_token.write().await = rotated;
        }

        let ttl = (response.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(0) as u64)
            .saturating_sub(TOKEN_EXPIRY_BUFFER_SECS);
        *cache = Some(CachedAccessToken {
            token: response.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        debug!("[Session] Access token refreshed and cached (TTL {}s)", ttl);
        Ok(response.access_token)
    }

    async fn reset(&self) {
        *self.cache.write().await = None;
        debug!("[Session] Cached access token dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{respond, start_mock_server};
    use huddle_core::sync::SyncRetryClass;
    use serde_json::json;

    fn token_body(access: &str, refresh: &str) -> String {
        json!({ "access_token": access, "refresh_token": refresh, "expires_in": 3600 }).to_string()
    }

    #[tokio::test]
    async fn caches_token_until_reset_and_uses_rotated_refresh_token() {
        let (auth_url, captured) = start_mock_server(vec![
            respond(200, token_body("a1", "r2")),
            respond(200, token_body("a2", "r3")),
        ])
        .await;
        let session =
            RefreshTokenSession::new(&auth_url, Some("anon".into()), "r1".into()).expect("session");

        assert_eq!(session.access_token().await.expect("first"), "a1");
        assert_eq!(session.access_token().await.expect("cached"), "a1");
        assert_eq!(captured.lock().await.len(), 1);

        session.reset().await;
        assert_eq!(session.access_token().await.expect("after reset"), "a2");
        assert_eq!(session.current_refresh_token().await, "r3");

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[0]
            .request_line
            .starts_with("POST /auth/v1/token?grant_type=refresh_token"));
        assert_eq!(requests[0].headers.get("apikey").map(String::as_str), Some("anon"));
        let second: serde_json::Value = serde_json::from_str(&requests[1].body).expect("json");
        assert_eq!(second["refresh_token"], "r2");
    }

    #[tokio::test]
    async fn rejected_refresh_requires_sign_in() {
        let (auth_url, _captured) = start_mock_server(vec![respond(
            400,
            json!({ "error": "invalid_grant", "error_description": "Refresh Token Not Found" })
                .to_string(),
        )])
        .await;
        let session = RefreshTokenSession::new(&auth_url, None, "stale".into()).expect("session");

        let err = session.access_token().await.expect_err("rejected");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_a_session_error() {
        let session =
            RefreshTokenSession::new("http://127.0.0.1:9", None, String::new()).expect("session");
        assert!(matches!(
            session.access_token().await,
            Err(Error::Session(_))
        ));
    }
}
