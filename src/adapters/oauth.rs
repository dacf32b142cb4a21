//! OAuth token refresh for Codex, Gemini-official and Kiro credentials.
//!
//! Only the refresh path touches the hot path: when a credential's stored
//! `expires_at` falls within a 5-minute window of now, it is refreshed
//! synchronously before dispatch. On success the new token fields are
//! persisted; on failure with a still-valid token the attempt proceeds with a
//! warning; on failure with an expired token the credential is skipped via
//! [`ProxyError::TokenRefreshFailed`] so the retry driver moves on.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use super::DialectAdapter;
use crate::cache::ChannelCache;
use crate::error::ProxyError;
use crate::store::{Credential, OauthBundle, Store};

/// Refresh when less than this many seconds of validity remain.
pub const REFRESH_WINDOW_SECS: i64 = 300;

const CODEX_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CODEX_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GOOGLE_CLIENT_SECRET: &str = "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";
const KIRO_TOKEN_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

pub struct OauthRefresher {
    http: reqwest::Client,
    store: Arc<Store>,
    cache: Arc<ChannelCache>,
    /// Test hook: overrides every provider token endpoint when set.
    token_url_override: Option<String>,
}

impl OauthRefresher {
    pub fn new(http: reqwest::Client, store: Arc<Store>, cache: Arc<ChannelCache>) -> Self {
        Self { http, store, cache, token_url_override: None }
    }

    #[cfg(test)]
    pub fn with_token_url(mut self, url: &str) -> Self {
        self.token_url_override = Some(url.to_string());
        self
    }

    /// Returns the credential to dispatch with — refreshed when needed.
    pub async fn refresh_if_needed(
        &self,
        adapter: DialectAdapter,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<Credential, ProxyError> {
        if !adapter.uses_oauth() {
            return Ok(credential.clone());
        }
        let Some(oauth) = &credential.oauth else {
            // API-key credential on an OAuth-capable adapter; nothing to do.
            return Ok(credential.clone());
        };
        let Some(expires_at) = oauth.expires_at else {
            return Ok(credential.clone());
        };
        if expires_at - now > Duration::seconds(REFRESH_WINDOW_SECS) {
            return Ok(credential.clone());
        }

        match self.refresh(adapter, oauth).await {
            Ok(bundle) => {
                if let Err(e) = self.store.update_oauth_tokens(
                    credential.channel_id,
                    credential.index,
                    &bundle,
                ) {
                    tracing::warn!(
                        channel_id = credential.channel_id,
                        key_index = credential.index,
                        error = %e,
                        "persisting refreshed token failed"
                    );
                }
                self.cache.invalidate_keys(credential.channel_id);
                tracing::info!(
                    channel_id = credential.channel_id,
                    key_index = credential.index,
                    "oauth token refreshed"
                );
                let mut refreshed = credential.clone();
                refreshed.oauth = Some(bundle);
                Ok(refreshed)
            }
            Err(e) if expires_at > now => {
                tracing::warn!(
                    channel_id = credential.channel_id,
                    key_index = credential.index,
                    error = %e,
                    "token refresh failed — proceeding with still-valid token"
                );
                Ok(credential.clone())
            }
            Err(e) => Err(ProxyError::TokenRefreshFailed(e.to_string())),
        }
    }

    async fn refresh(
        &self,
        adapter: DialectAdapter,
        oauth: &OauthBundle,
    ) -> anyhow::Result<OauthBundle> {
        let response = match adapter {
            DialectAdapter::Codex => {
                let url = self.endpoint(CODEX_TOKEN_URL);
                self.http
                    .post(url)
                    .json(&json!({
                        "client_id": CODEX_CLIENT_ID,
                        "grant_type": "refresh_token",
                        "refresh_token": oauth.refresh_token,
                        "scope": "openid profile email",
                    }))
                    .send()
                    .await?
            }
            DialectAdapter::GeminiStandard | DialectAdapter::GeminiCli => {
                let url = self.endpoint(GOOGLE_TOKEN_URL);
                self.http
                    .post(url)
                    .form(&[
                        ("client_id", GOOGLE_CLIENT_ID),
                        ("client_secret", GOOGLE_CLIENT_SECRET),
                        ("refresh_token", oauth.refresh_token.as_str()),
                        ("grant_type", "refresh_token"),
                    ])
                    .send()
                    .await?
            }
            DialectAdapter::Kiro => {
                let url = self.endpoint(KIRO_TOKEN_URL);
                self.http
                    .post(url)
                    .json(&json!({ "refreshToken": oauth.refresh_token }))
                    .send()
                    .await?
            }
            DialectAdapter::AnthropicPassthrough => {
                anyhow::bail!("anthropic credentials do not refresh")
            }
        };

        let status = response.status();
        let body = response.text().await?;
        anyhow::ensure!(status.is_success(), "token endpoint returned HTTP {status}: {body}");

        let value: Value = serde_json::from_str(&body)?;
        let access_token = value["access_token"]
            .as_str()
            .or_else(|| value["accessToken"].as_str())
            .ok_or_else(|| anyhow::anyhow!("token response missing access_token"))?
            .to_string();
        let refresh_token = value["refresh_token"]
            .as_str()
            .or_else(|| value["refreshToken"].as_str())
            .unwrap_or(&oauth.refresh_token)
            .to_string();
        let expires_at = value["expires_in"]
            .as_i64()
            .or_else(|| value["expiresIn"].as_i64())
            .map(|secs| Utc::now() + Duration::seconds(secs));

        Ok(OauthBundle {
            access_token,
            refresh_token,
            id_token: value["id_token"].as_str().map(str::to_string).or_else(|| oauth.id_token.clone()),
            expires_at: expires_at.or(oauth.expires_at),
        })
    }

    fn endpoint(&self, default: &str) -> String {
        self.token_url_override.clone().unwrap_or_else(|| default.to_string())
    }

    /// Proactive sweep over every OAuth credential, run on a slow background
    /// tick so refresh tokens stay exercised even on idle channels. Failures
    /// are logged and left for the on-demand path to deal with.
    pub async fn sweep(&self) {
        let channels = match self.store.list_channels() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "oauth sweep could not list channels");
                return;
            }
        };
        for channel in channels {
            let adapter = DialectAdapter::for_channel(&channel);
            if !adapter.uses_oauth() {
                continue;
            }
            let creds = match self.store.keys_for_channel(channel.id) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(channel_id = channel.id, error = %e, "oauth sweep key load failed");
                    continue;
                }
            };
            for credential in creds {
                let Some(oauth) = &credential.oauth else { continue };
                match self.refresh(adapter, oauth).await {
                    Ok(bundle) => {
                        if let Err(e) = self.store.update_oauth_tokens(
                            credential.channel_id,
                            credential.index,
                            &bundle,
                        ) {
                            tracing::warn!(
                                channel_id = credential.channel_id,
                                key_index = credential.index,
                                error = %e,
                                "oauth sweep persist failed"
                            );
                        }
                        self.cache.invalidate_keys(credential.channel_id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel_id = credential.channel_id,
                            key_index = credential.index,
                            error = %e,
                            "oauth sweep refresh failed"
                        );
                    }
                }
            }
        }
    }
}
