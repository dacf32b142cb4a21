//! Gemini adapters — standard API and the Gemini-CLI (cloudcode) flavor.
//!
//! The standard preset is a Bearer-auth passthrough: no path or body rewrite,
//! usage comes from `usageMetadata` in the final JSON or last SSE frame.
//!
//! The CLI preset fronts the internal cloudcode endpoint: the public
//! `/v1beta/models/{m}:streamGenerateContent` path is rewritten to
//! `/v1internal:streamGenerateContent?alt=sse`, the body is wrapped in the
//! CLI envelope `{model, project, user_prompt_id, request}`, the fixed CLI
//! user-agent is pinned, and each response event is unwrapped from its
//! `response` field before reaching the client.

use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{bearer_secret, AdapterContext, PreparedRequest};
use crate::error::ProxyError;

/// Project id the cloudcode endpoint expects from CLI traffic.
const CLI_PROJECT: &str = "causal-voltage-327sp";
const CLI_USER_AGENT: &str = "GeminiCLI/0.4.1 (linux; x64)";

fn bearer_headers(ctx: &AdapterContext<'_>) -> Result<HeaderMap, ProxyError> {
    let token = bearer_secret(ctx.credential)?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ProxyError::UpstreamTransport("token not header-safe".into()))?,
    );
    Ok(headers)
}

pub(super) fn prepare_standard(
    ctx: &AdapterContext<'_>,
    body: &Value,
) -> Result<PreparedRequest, ProxyError> {
    let headers = bearer_headers(ctx)?;
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

pub(super) fn prepare_cli(
    ctx: &AdapterContext<'_>,
    body: &Value,
) -> Result<PreparedRequest, ProxyError> {
    let mut headers = bearer_headers(ctx)?;
    headers.insert(header::USER_AGENT, HeaderValue::from_static(CLI_USER_AGENT));

    let base = ctx.channel.effective_url().trim_end_matches('/');
    let url = if ctx.path.ends_with(":streamGenerateContent") || ctx.streaming {
        format!("{base}/v1internal:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1internal:generateContent")
    };

    let envelope = json!({
        "model": ctx.model,
        "project": CLI_PROJECT,
        "user_prompt_id": Uuid::new_v4().to_string(),
        "request": body,
    });

    Ok(PreparedRequest {
        url,
        body: serde_json::to_vec(&envelope)
            .map_err(|e| ProxyError::ClientBadRequest(e.to_string()))?,
        headers,
    })
}

/// Model name embedded in a Gemini request path, e.g.
/// `/v1beta/models/gemini-2.5-pro:streamGenerateContent`.
pub fn model_from_path(path: &str) -> Option<&str> {
    let rest = path.split("/models/").nth(1)?;
    let model = rest.split(':').next()?;
    (!model.is_empty()).then_some(model)
}

/// Streaming unwrapper for CLI responses: strips the `{"response": …}`
/// envelope from each SSE event, passing everything else through.
#[derive(Debug, Default)]
pub struct GeminiCliUnwrapper {
    buffer: Vec<u8>,
}

impl GeminiCliUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).to_string();
            self.handle_line(&line, &mut out);
        }
        out
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).to_string();
            self.handle_line(&line, &mut out);
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<u8>) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
            return;
        };
        if data.is_empty() {
            out.extend_from_slice(b"data:\n");
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => {
                let inner = value.get("response").cloned().unwrap_or(value);
                out.extend_from_slice(format!("data: {inner}\n").as_bytes());
            }
            Err(_) => {
                out.extend_from_slice(line.as_bytes());
                out.push(b'\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Channel, ChannelPreset, ChannelType, Credential, KeyStrategy, OauthBundle};

    fn channel() -> Channel {
        Channel {
            id: 1,
            name: "gemini".into(),
            channel_type: ChannelType::Gemini,
            preset: Some(ChannelPreset::Antigravity),
            base_url: "https://cloudcode-pa.googleapis.com".into(),
            priority: 10,
            enabled: true,
            models: vec!["gemini-2.5-pro".into()],
            redirects: Default::default(),
            openai_compatible: false,
            key_strategy: KeyStrategy::Sequential,
            key_count: 1,
            endpoints: vec![],
        }
    }

    fn credential() -> Credential {
        Credential {
            channel_id: 1,
            index: 0,
            api_key: None,
            oauth: Some(OauthBundle {
                access_token: "ya29.token".into(),
                refresh_token: "1//refresh".into(),
                id_token: None,
                expires_at: None,
            }),
            device_fingerprint: None,
        }
    }

    fn ctx<'a>(channel: &'a Channel, credential: &'a Credential, path: &'a str) -> AdapterContext<'a> {
        AdapterContext {
            channel,
            credential,
            model: "gemini-2.5-pro",
            path,
            query: Some("alt=sse"),
            streaming: true,
        }
    }

    // -----------------------------------------------------------------------
    // Path handling
    // -----------------------------------------------------------------------

    #[test]
    fn model_parsed_from_public_path() {
        assert_eq!(
            model_from_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            Some("gemini-2.5-pro")
        );
        assert_eq!(model_from_path("/v1beta/models/gemini-2.5-flash:generateContent"), Some("gemini-2.5-flash"));
        assert_eq!(model_from_path("/v1beta/models"), None);
    }

    #[test]
    fn cli_rewrites_stream_path_and_wraps_body() {
        let channel = channel();
        let credential = credential();
        let ctx = ctx(&channel, &credential, "/v1beta/models/gemini-2.5-pro:streamGenerateContent");
        let body = json!({ "contents": [{ "parts": [{ "text": "hi" }] }] });

        let prepared = prepare_cli(&ctx, &body).unwrap();
        assert_eq!(
            prepared.url,
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        let sent: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(sent["model"], "gemini-2.5-pro");
        assert_eq!(sent["project"], CLI_PROJECT);
        assert_eq!(sent["request"], body);
        assert!(sent["user_prompt_id"].as_str().unwrap().len() >= 32);
        assert_eq!(prepared.headers.get(header::USER_AGENT).unwrap(), CLI_USER_AGENT);
    }

    #[test]
    fn cli_rewrites_non_stream_path() {
        let channel = channel();
        let credential = credential();
        let mut ctx = ctx(&channel, &credential, "/v1beta/models/gemini-2.5-pro:generateContent");
        ctx.streaming = false;
        let prepared = prepare_cli(&ctx, &json!({})).unwrap();
        assert_eq!(prepared.url, "https://cloudcode-pa.googleapis.com/v1internal:generateContent");
    }

    #[test]
    fn standard_preset_keeps_path() {
        let mut channel = channel();
        channel.preset = None;
        channel.base_url = "https://generativelanguage.googleapis.com".into();
        let credential = credential();
        let ctx = ctx(&channel, &credential, "/v1beta/models/gemini-2.5-pro:streamGenerateContent");

        let prepared = prepare_standard(&ctx, &json!({"contents": []})).unwrap();
        assert_eq!(
            prepared.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(prepared.headers.get(header::AUTHORIZATION).unwrap(), "Bearer ya29.token");
    }

    // -----------------------------------------------------------------------
    // Envelope unwrap
    // -----------------------------------------------------------------------

    #[test]
    fn unwrapper_strips_response_envelope() {
        let mut u = GeminiCliUnwrapper::new();
        let out = u.transform(
            b"data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}}\n\n",
        );
        let text = String::from_utf8(out).unwrap();
        let event: Value = serde_json::from_str(text.lines().next().unwrap().strip_prefix("data: ").unwrap()).unwrap();
        assert!(event.get("response").is_none());
        assert_eq!(event["candidates"][0]["content"]["parts"][0]["text"], "Hi");
    }

    #[test]
    fn unwrapper_passes_plain_events_through() {
        let mut u = GeminiCliUnwrapper::new();
        let out = u.transform(b"data: {\"candidates\":[]}\n");
        assert_eq!(String::from_utf8(out).unwrap(), "data: {\"candidates\":[]}\n");
    }

    #[test]
    fn unwrapper_tolerates_split_lines() {
        let mut u = GeminiCliUnwrapper::new();
        let mut out = u.transform(b"data: {\"response\":{\"ok\"");
        assert!(out.is_empty());
        out.extend(u.transform(b":true}}\n"));
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "data: {\"ok\":true}\n");
    }
}
