//! Codex (OpenAI Responses) adapter.
//!
//! Codex channels speak the Responses API over OAuth. Two client dialects
//! arrive here:
//!
//! - native Responses bodies are forwarded as-is;
//! - OpenAI chat-completions bodies are converted to the Responses shape on
//!   the way in and the Responses SSE is translated back to chat-completions
//!   SSE (including the terminating `[DONE]`) on the way out.
//!
//! Auth is `Bearer <access_token>` plus the per-request `session_id` /
//! `conversation_id` / `chatgpt-account-id` headers; the account id is
//! decoded from the JWT access-token payload.

use axum::http::{header, HeaderMap, HeaderValue};
use base64::Engine as _;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{bearer_secret, AdapterContext, PreparedRequest};
use crate::error::ProxyError;

/// Instructions field the Responses API requires for Codex sessions.
const CODEX_INSTRUCTIONS: &str =
    "You are Codex, a coding agent. Answer concisely and use the provided tools when appropriate.";

/// A chat-completions body carries `messages`; a native Responses body
/// carries `input` (and usually `instructions`).
pub(super) fn is_chat_completions_shape(body: &Value) -> bool {
    body.get("messages").is_some_and(Value::is_array) && body.get("input").is_none()
}

pub(super) fn prepare(
    ctx: &AdapterContext<'_>,
    body: &Value,
) -> Result<PreparedRequest, ProxyError> {
    let token = bearer_secret(ctx.credential)?;

    let out_body = if is_chat_completions_shape(body) {
        to_responses(body, ctx.model)?
    } else {
        let mut native = body.clone();
        if let Some(obj) = native.as_object_mut() {
            obj.insert("model".into(), Value::String(ctx.model.to_string()));
            obj.insert("stream".into(), Value::Bool(true));
            obj.insert("store".into(), Value::Bool(false));
        }
        native
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ProxyError::UpstreamTransport("token not header-safe".into()))?,
    );
    headers.insert("session_id", uuid_header());
    headers.insert("conversation_id", uuid_header());
    if let Some(account_id) = account_id_from_jwt(&token) {
        if let Ok(value) = HeaderValue::from_str(&account_id) {
            headers.insert("chatgpt-account-id", value);
        }
    }
    headers.insert("openai-beta", HeaderValue::from_static("responses=experimental"));

    let base = ctx.channel.effective_url().trim_end_matches('/');
    Ok(PreparedRequest {
        url: format!("{base}/v1/responses"),
        body: serde_json::to_vec(&out_body)
            .map_err(|e| ProxyError::ClientBadRequest(e.to_string()))?,
        headers,
    })
}

fn uuid_header() -> HeaderValue {
    HeaderValue::from_str(&Uuid::new_v4().to_string()).expect("uuid is header-safe")
}

/// Convert an OpenAI chat-completions request into a Responses request.
pub(crate) fn to_responses(body: &Value, model: &str) -> Result<Value, ProxyError> {
    let messages = body["messages"]
        .as_array()
        .ok_or_else(|| ProxyError::ClientBadRequest("`messages` array is required".into()))?;

    let mut input = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = msg["role"].as_str().unwrap_or("user");
        let text = match &msg["content"] {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };
        let part_type = if role == "assistant" { "output_text" } else { "input_text" };
        input.push(json!({
            "role": role,
            "content": [{ "type": part_type, "text": text }],
        }));
    }

    let mut out = json!({
        "model": model,
        "instructions": CODEX_INSTRUCTIONS,
        "input": input,
        "tools": body.get("tools").cloned().unwrap_or_else(|| json!([])),
        "tool_choice": "auto",
        "parallel_tool_calls": false,
        "reasoning": {
            "effort": body.get("reasoning_effort").and_then(Value::as_str).unwrap_or("medium"),
            "summary": "auto",
        },
        "include": ["reasoning.encrypted_content"],
        "prompt_cache_key": Uuid::new_v4().to_string(),
        "stream": true,
        "store": false,
    });

    if let Some(temp) = body.get("temperature").and_then(Value::as_f64) {
        out["temperature"] = json!(temp);
    } else if let Some(top_p) = body.get("top_p").and_then(Value::as_f64) {
        // top_p travels only when temperature is absent.
        out["top_p"] = json!(top_p);
    }
    if let Some(max) = body.get("max_tokens").and_then(Value::as_u64) {
        out["max_output_tokens"] = json!(max);
    }

    Ok(out)
}

/// Pull the ChatGPT account id out of a JWT access token's payload.
pub(crate) fn account_id_from_jwt(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims["https://api.openai.com/auth"]["chatgpt_account_id"]
        .as_str()
        .or_else(|| claims["sub"].as_str())
        .map(str::to_string)
}

/// Streaming translator: Responses SSE in, chat-completions SSE out.
///
/// Only `response.output_text.delta` and `response.completed` are mapped;
/// reasoning/tool frames the chat dialect cannot express are dropped.
#[derive(Debug, Default)]
pub struct CodexSseTranslator {
    buffer: Vec<u8>,
    chunk_id: String,
    done_sent: bool,
}

impl CodexSseTranslator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            chunk_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            done_sent: false,
        }
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
        let Some(data) = line.strip_prefix("data:").map(|d| d.trim()) else {
            return;
        };
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match event["type"].as_str() {
            Some("response.output_text.delta") => {
                let delta = event["delta"].as_str().unwrap_or_default();
                self.push_chunk(
                    out,
                    json!({ "content": delta }),
                    None,
                    None,
                );
            }
            Some("response.completed") => {
                let usage = &event["response"]["usage"];
                let mapped_usage = json!({
                    "prompt_tokens": usage["input_tokens"].as_i64().unwrap_or(0),
                    "completion_tokens": usage["output_tokens"].as_i64().unwrap_or(0),
                    "total_tokens": usage["input_tokens"].as_i64().unwrap_or(0)
                        + usage["output_tokens"].as_i64().unwrap_or(0),
                });
                self.push_chunk(out, json!({}), Some("stop"), Some(mapped_usage));
                out.extend_from_slice(b"data: [DONE]\n\n");
                self.done_sent = true;
            }
            _ => {}
        }
    }

    fn push_chunk(
        &self,
        out: &mut Vec<u8>,
        delta: Value,
        finish_reason: Option<&str>,
        usage: Option<Value>,
    ) {
        let mut chunk = json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        out.extend_from_slice(format!("data: {chunk}\n\n").as_bytes());
    }
}
