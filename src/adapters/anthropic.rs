//! Anthropic Messages passthrough adapter.
//!
//! No body transform and no path rewrite — the client already speaks the
//! upstream dialect. The adapter only swaps authentication: the client's
//! credentials were consumed by the proxy's own auth layer, and the channel
//! credential is injected as `x-api-key` plus the pinned API version header.

use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::Value;

use super::{AdapterContext, PreparedRequest};
use crate::error::ProxyError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(super) fn prepare(
    ctx: &AdapterContext<'_>,
    body: &Value,
) -> Result<PreparedRequest, ProxyError> {
    let secret = ctx
        .credential
        .api_key
        .clone()
        .or_else(|| ctx.credential.oauth.as_ref().map(|o| o.access_token.clone()))
        .ok_or_else(|| {
            ProxyError::UpstreamTransport("anthropic credential has no key".into())
        })?;

    let mut headers = HeaderMap::new();
    // OAuth-carrying credentials (claude.ai accounts) authenticate with a
    // Bearer token instead of x-api-key.
    if ctx.credential.api_key.is_some() {
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&secret)
                .map_err(|_| ProxyError::UpstreamTransport("api key not header-safe".into()))?,
        );
    } else {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}"))
                .map_err(|_| ProxyError::UpstreamTransport("token not header-safe".into()))?,
        );
    }
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

    let base = ctx.channel.effective_url().trim_end_matches('/');
    let url = match ctx.query {
        Some(q) => format!("{base}{}?{q}", ctx.path),
        None => format!("{base}{}", ctx.path),
    };

    Ok(PreparedRequest {
        url,
        body: serde_json::to_vec(body)
            .map_err(|e| ProxyError::ClientBadRequest(e.to_string()))?,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Channel, ChannelType, Credential, KeyStrategy};
    use serde_json::json;

    fn channel() -> Channel {
        Channel {
            id: 1,
            name: "anthropic".into(),
            channel_type: ChannelType::Anthropic,
            preset: None,
            base_url: "https://api.anthropic.com/".into(),
            priority: 10,
            enabled: true,
            models: vec!["claude-sonnet-4-5".into()],
            redirects: Default::default(),
            openai_compatible: false,
            key_strategy: KeyStrategy::Sequential,
            key_count: 1,
            endpoints: vec![],
        }
    }

    fn key_credential() -> Credential {
        Credential {
            channel_id: 1,
            index: 0,
            api_key: Some("sk-ant-test".into()),
            oauth: None,
            device_fingerprint: None,
        }
    }

    #[test]
    fn path_and_body_unchanged() {
        let channel = channel();
        let credential = key_credential();
        let ctx = AdapterContext {
            channel: &channel,
            credential: &credential,
            model: "claude-sonnet-4-5",
            path: "/v1/messages",
            query: None,
            streaming: true,
        };
        let body = json!({"model":"claude-sonnet-4-5","max_tokens":64,"messages":[]});

        let prepared = prepare(&ctx, &body).unwrap();
        assert_eq!(prepared.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(serde_json::from_slice::<Value>(&prepared.body).unwrap(), body);
        assert_eq!(prepared.headers.get("x-api-key").unwrap(), "sk-ant-test");
        assert_eq!(prepared.headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn query_string_is_preserved() {
        let channel = channel();
        let credential = key_credential();
        let ctx = AdapterContext {
            channel: &channel,
            credential: &credential,
            model: "claude-sonnet-4-5",
            path: "/v1/messages",
            query: Some("beta=true"),
            streaming: false,
        };
        let prepared = prepare(&ctx, &json!({})).unwrap();
        assert_eq!(prepared.url, "https://api.anthropic.com/v1/messages?beta=true");
    }

    #[test]
    fn oauth_credential_uses_bearer() {
        let channel = channel();
        let credential = Credential {
            channel_id: 1,
            index: 0,
            api_key: None,
            oauth: Some(crate::store::OauthBundle {
                access_token: "at-123".into(),
                refresh_token: "rt".into(),
                id_token: None,
                expires_at: None,
            }),
            device_fingerprint: None,
        };
        let ctx = AdapterContext {
            channel: &channel,
            credential: &credential,
            model: "claude-sonnet-4-5",
            path: "/v1/messages",
            query: None,
            streaming: false,
        };
        let prepared = prepare(&ctx, &json!({})).unwrap();
        assert!(prepared.headers.get("x-api-key").is_none());
        assert_eq!(
            prepared.headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer at-123"
        );
    }
}
