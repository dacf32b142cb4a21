//! Kiro (AWS CodeWhisperer) adapter.
//!
//! The most invasive adapter of the set: Anthropic Messages requests are
//! rebuilt as CodeWhisperer conversation state, authentication mimics the AWS
//! SDK (header suite derived from a per-credential device fingerprint), and
//! the response is a binary AWS EventStream that is decoded frame-by-frame
//! and re-emitted as Anthropic SSE.
//!
//! Input tokens are estimated locally — the upstream does not return them.

use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{AdapterContext, PreparedRequest};
use crate::error::ProxyError;
use crate::tokenizer;

const KIRO_VERSION: &str = "0.8.0";
const OS_NAME: &str = "linux";
const NODE_VERSION: &str = "20.18.1";

/// Anthropic model name → CodeWhisperer model id. Requests for models
/// outside this table are rejected before dispatch.
const MODEL_TABLE: [(&str, &str); 5] = [
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
];

/// Error-body marker for oversized conversations; mapped to a synthetic
/// `max_tokens` success instead of a failure.
pub const CONTENT_LENGTH_MARKER: &str = "CONTENT_LENGTH_EXCEEDS_THRESHOLD";

const MAX_TOOL_DESCRIPTION: usize = 1024;

pub(crate) fn map_model(model: &str) -> Result<&'static str, ProxyError> {
    MODEL_TABLE
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, id)| *id)
        .ok_or_else(|| {
            ProxyError::ClientBadRequest(format!("model `{model}` is not supported by this channel"))
        })
}

/// Stable 64-hex device identity; generated lazily per credential and then
/// persisted.
pub fn generate_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

/// Local estimate of the request's input tokens. `body` must be the
/// client's Messages request, not the [`to_codewhisperer`] output — the
/// counter walks `system`/`messages`/`tools`.
pub(super) fn estimate_input_tokens(body: &Value) -> i64 {
    tokenizer::count_request_tokens(body)
}

pub(super) fn prepare(
    ctx: &AdapterContext<'_>,
    body: &Value,
) -> Result<PreparedRequest, ProxyError> {
    let oauth = ctx.credential.oauth.as_ref().ok_or_else(|| {
        ProxyError::UpstreamTransport("kiro credential has no OAuth bundle".into())
    })?;
    let fingerprint = ctx
        .credential
        .device_fingerprint
        .clone()
        .unwrap_or_else(generate_fingerprint);

    let model_id = map_model(ctx.model)?;
    let transformed = to_codewhisperer(body, model_id)?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-amzn-codewhisperer-optout", HeaderValue::from_static("true"));
    headers.insert("x-amzn-kiro-agent-mode", HeaderValue::from_static("vibe"));

    let x_amz_user_agent = format!("aws-sdk-js/1.0.27 KiroIDE-{KIRO_VERSION}-{fingerprint}");
    let user_agent = format!(
        "aws-sdk-js/1.0.27 ua/2.1 os/{OS_NAME} lang/js md/nodejs#{NODE_VERSION} \
         api/codewhispererstreaming#1.0.27 m/E KiroIDE-{KIRO_VERSION}-{fingerprint}"
    );
    headers.insert(
        "x-amz-user-agent",
        HeaderValue::from_str(&x_amz_user_agent)
            .map_err(|_| ProxyError::UpstreamTransport("fingerprint not header-safe".into()))?,
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&user_agent)
            .map_err(|_| ProxyError::UpstreamTransport("fingerprint not header-safe".into()))?,
    );
    headers.insert(
        "amz-sdk-invocation-id",
        HeaderValue::from_str(&Uuid::new_v4().to_string()).expect("uuid is header-safe"),
    );
    headers.insert("amz-sdk-request", HeaderValue::from_static("attempt=1; max=3"));
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", oauth.access_token))
            .map_err(|_| ProxyError::UpstreamTransport("token not header-safe".into()))?,
    );

    let base = ctx.channel.effective_url().trim_end_matches('/');
    Ok(PreparedRequest {
        url: format!("{base}/generateAssistantResponse"),
        body: serde_json::to_vec(&transformed)
            .map_err(|e| ProxyError::ClientBadRequest(e.to_string()))?,
        headers,
    })
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_results(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return vec![];
    };
    blocks
        .iter()
        .filter(|b| b["type"] == "tool_result")
        .map(|b| {
            let text = match &b["content"] {
                Value::String(s) => s.clone(),
                other => content_text(other),
            };
            json!({
                "toolUseId": b["tool_use_id"],
                "content": [{ "text": text }],
                "status": if b["is_error"].as_bool().unwrap_or(false) { "error" } else { "success" },
            })
        })
        .collect()
}

/// Rebuild an Anthropic Messages body as CodeWhisperer conversation state.
pub(crate) fn to_codewhisperer(body: &Value, model_id: &str) -> Result<Value, ProxyError> {
    let messages = body["messages"]
        .as_array()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::ClientBadRequest("`messages` array is required".into()))?;

    // Merge consecutive same-role messages, keeping block text only.
    let mut merged: Vec<(String, String)> = Vec::new();
    for msg in messages {
        let role = msg["role"].as_str().unwrap_or("user").to_string();
        let text = content_text(&msg["content"]);
        match merged.last_mut() {
            Some((last_role, last_text)) if *last_role == role => {
                if !text.is_empty() {
                    if !last_text.is_empty() {
                        last_text.push('\n');
                    }
                    last_text.push_str(&text);
                }
            }
            _ => merged.push((role, text)),
        }
    }

    let (_, current_text) = merged.pop().expect("non-empty after validation");

    let mut history: Vec<Value> = Vec::with_capacity(merged.len() + 1);
    for (role, text) in &merged {
        if role == "assistant" {
            history.push(json!({ "assistantResponseMessage": { "content": text } }));
        } else {
            history.push(json!({
                "userInputMessage": { "content": text, "modelId": model_id, "origin": "AI_EDITOR" },
            }));
        }
    }
    // An orphan trailing user turn gets a synthetic acknowledgment so the
    // history stays strictly alternating.
    if merged.last().is_some_and(|(role, _)| role == "user") {
        history.push(json!({ "assistantResponseMessage": { "content": "OK" } }));
    }

    let mut context = json!({});
    if let Some(tools) = body["tools"].as_array() {
        let specs: Vec<Value> = tools
            .iter()
            .filter(|t| {
                let name = t["name"].as_str().unwrap_or_default();
                let tool_type = t["type"].as_str().unwrap_or_default();
                !name.contains("web_search") && !tool_type.starts_with("web_search")
            })
            .map(|t| {
                let mut description = t["description"].as_str().unwrap_or_default().to_string();
                description.truncate(MAX_TOOL_DESCRIPTION);
                json!({
                    "toolSpecification": {
                        "name": t["name"],
                        "description": description,
                        "inputSchema": { "json": t["input_schema"].clone() },
                    },
                })
            })
            .collect();
        if !specs.is_empty() {
            context["tools"] = json!(specs);
        }
    }
    let results = messages
        .last()
        .map(|m| tool_results(&m["content"]))
        .unwrap_or_default();
    if !results.is_empty() {
        context["toolResults"] = json!(results);
    }

    let mut current = json!({
        "content": current_text,
        "modelId": model_id,
        "origin": "AI_EDITOR",
    });
    if context.as_object().is_some_and(|o| !o.is_empty()) {
        current["userInputMessageContext"] = context;
    }

    let mut out = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": Uuid::new_v4().to_string(),
            "currentMessage": { "userInputMessage": current },
            "history": history,
        },
    });

    if let Some(thinking) = body.get("thinking").filter(|t| !t.is_null()) {
        out["inferenceConfiguration"] = json!({
            "thinking": {
                "enabled": thinking["type"] == "enabled",
                "budgetTokens": thinking["budget_tokens"].clone(),
            },
        });
    }

    Ok(out)
}

/// Anthropic SSE stream for the oversized-conversation case: a well-formed
/// reply that stops with `max_tokens` instead of surfacing the upstream 400.
pub fn synthetic_max_tokens_sse(model: &str, input_tokens: i64) -> Vec<u8> {
    let id = format!("msg_{}", Uuid::new_v4().simple());
    let mut out = String::new();
    out.push_str(&format!(
        "event: message_start\ndata: {}\n\n",
        json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "usage": { "input_tokens": input_tokens, "output_tokens": 0 },
            },
        })
    ));
    out.push_str(&format!(
        "event: message_delta\ndata: {}\n\n",
        json!({
            "type": "message_delta",
            "delta": { "stop_reason": "max_tokens", "stop_sequence": null },
            "usage": { "output_tokens": 0 },
        })
    ));
    out.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    out.into_bytes()
}

// ---------------------------------------------------------------------------
// AWS EventStream decoding
// ---------------------------------------------------------------------------

/// One decoded EventStream frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub event_type: String,
    pub exception: bool,
    pub payload: Value,
}

/// Incremental binary frame decoder.
///
/// Frame layout: 12-byte prelude (`total_len`, `headers_len`, prelude CRC) →
/// headers → JSON payload → 4-byte message CRC. CRC trailers are not
/// verified; a corrupt frame surfaces as a JSON parse miss instead.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a partially-received frame is still buffered — the stream
    /// was cut mid-frame.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < 12 {
                break;
            }
            let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
            if total_len < 16 || total_len > 16 * 1024 * 1024 {
                // Unrecoverable framing error; drop the buffer.
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < total_len {
                break;
            }
            let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
            let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
            if 12 + headers_len + 4 > total_len {
                continue;
            }
            let headers = parse_headers(&frame[12..12 + headers_len]);
            let payload = &frame[12 + headers_len..total_len - 4];

            let message_type = headers
                .iter()
                .find(|(k, _)| k == ":message-type")
                .map(|(_, v)| v.as_str())
                .unwrap_or("event");
            let event_type = headers
                .iter()
                .find(|(k, _)| k == ":event-type" || k == ":exception-type")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();

            let payload = serde_json::from_slice::<Value>(payload).unwrap_or(Value::Null);
            frames.push(DecodedFrame {
                event_type,
                exception: message_type == "exception",
                payload,
            });
        }
        frames
    }
}

/// Parse EventStream headers: `name_len u8 | name | type u8 | value`.
/// Only string values (type 7) are retained.
fn parse_headers(mut bytes: &[u8]) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    while bytes.len() >= 2 {
        let name_len = bytes[0] as usize;
        if bytes.len() < 1 + name_len + 1 {
            break;
        }
        let name = String::from_utf8_lossy(&bytes[1..1 + name_len]).to_string();
        let value_type = bytes[1 + name_len];
        bytes = &bytes[1 + name_len + 1..];
        match value_type {
            // String
            7 => {
                if bytes.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
                if bytes.len() < 2 + len {
                    break;
                }
                let value = String::from_utf8_lossy(&bytes[2..2 + len]).to_string();
                headers.push((name, value));
                bytes = &bytes[2 + len..];
            }
            // Boolean true/false carry no value bytes.
            0 | 1 => {}
            // Fixed-width numeric types.
            2 => bytes = bytes.get(1..).unwrap_or_default(),
            3 => bytes = bytes.get(2..).unwrap_or_default(),
            4 => bytes = bytes.get(4..).unwrap_or_default(),
            5 | 8 => bytes = bytes.get(8..).unwrap_or_default(),
            // Byte array / uuid.
            6 => {
                if bytes.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
                bytes = bytes.get(2 + len..).unwrap_or_default();
            }
            9 => bytes = bytes.get(16..).unwrap_or_default(),
            _ => break,
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// EventStream → Anthropic SSE translation
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Block {
    None,
    Thinking,
    Text,
    Tool,
}

/// Streaming translator from decoded CodeWhisperer frames to Anthropic SSE.
///
/// `<thinking>…</thinking>` spans at the head of the assistant output are
/// split into a dedicated `thinking` block; `toolUseEvent` fragments are
/// accumulated into a `tool_use` block until the `stop` frame closes it.
pub struct KiroEventStreamTranslator {
    decoder: EventStreamDecoder,
    message_id: String,
    model: String,
    input_tokens: i64,
    metered_output: Option<i64>,
    emitted_chars: usize,
    started: bool,
    block: Block,
    block_index: usize,
    lead: String,
    lead_decided: bool,
    thinking_tail: String,
    done: bool,
}

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

impl KiroEventStreamTranslator {
    pub fn new(model: &str, estimated_input_tokens: i64) -> Self {
        Self {
            decoder: EventStreamDecoder::new(),
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            input_tokens: estimated_input_tokens,
            metered_output: None,
            emitted_chars: 0,
            started: false,
            block: Block::None,
            block_index: 0,
            lead: String::new(),
            lead_decided: false,
            thinking_tail: String::new(),
            done: false,
        }
    }

    pub fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = String::new();
        for frame in self.decoder.feed(chunk) {
            self.handle_frame(&frame, &mut out);
        }
        out.into_bytes()
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = String::new();
        if self.done {
            return Vec::new();
        }
        if self.started && !self.decoder.has_partial() {
            self.flush_lead(&mut out);
            self.flush_thinking_tail(&mut out);
            self.close_block(&mut out);
            self.emit_stop(&mut out, "end_turn");
        }
        // A partial frame left in the decoder means the stream was cut; no
        // sentinel is emitted so the result is classified stream-incomplete.
        out.into_bytes()
    }

    fn handle_frame(&mut self, frame: &DecodedFrame, out: &mut String) {
        if self.done {
            return;
        }
        if frame.exception {
            if frame.payload.to_string().contains(CONTENT_LENGTH_MARKER) {
                self.ensure_started(out);
                self.flush_lead(out);
                self.flush_thinking_tail(out);
                self.close_block(out);
                self.emit_stop(out, "max_tokens");
            }
            // Other exceptions: stop translating; the missing sentinel marks
            // the stream incomplete downstream.
            return;
        }
        match frame.event_type.as_str() {
            "assistantResponseEvent" => {
                let content = frame.payload["content"].as_str().unwrap_or_default();
                self.ensure_started(out);
                self.push_text(content, out);
            }
            "toolUseEvent" => {
                self.ensure_started(out);
                self.handle_tool_frame(frame, out);
            }
            "meteringEvent" => {
                let amount = frame.payload["usage"]
                    .as_i64()
                    .or_else(|| frame.payload["amount"].as_i64())
                    .or_else(|| frame.payload["outputTokenCount"].as_i64());
                if let Some(amount) = amount {
                    self.metered_output = Some(amount);
                }
            }
            _ => {}
        }
    }

    fn handle_tool_frame(&mut self, frame: &DecodedFrame, out: &mut String) {
        if self.block != Block::Tool {
            self.flush_lead(out);
            self.flush_thinking_tail(out);
            self.close_block(out);
            let id = frame.payload["toolUseId"]
                .as_str()
                .unwrap_or_default()
                .replacen("tooluse_", "toolu_", 1);
            self.emit_event(
                out,
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": self.block_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": id,
                        "name": frame.payload["name"],
                        "input": {},
                    },
                }),
            );
            self.block = Block::Tool;
        }
        if let Some(fragment) = frame.payload["input"].as_str() {
            if !fragment.is_empty() {
                self.emit_event(
                    out,
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "input_json_delta", "partial_json": fragment },
                    }),
                );
            }
        }
        if frame.payload["stop"].as_bool().unwrap_or(false) {
            self.close_block(out);
        }
    }

    fn ensure_started(&mut self, out: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        self.emit_event(
            out,
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 },
                },
            }),
        );
    }

    /// Route assistant text through the thinking-detection state machine.
    fn push_text(&mut self, content: &str, out: &mut String) {
        if content.is_empty() {
            return;
        }
        if !self.lead_decided {
            self.lead.push_str(content);
            if self.lead.starts_with(THINKING_OPEN) {
                self.lead_decided = true;
                self.open_block(out, Block::Thinking);
                let rest = self.lead[THINKING_OPEN.len()..].to_string();
                self.lead.clear();
                self.push_thinking(&rest, out);
            } else if !THINKING_OPEN.starts_with(self.lead.as_str()) {
                // Cannot become "<thinking>" any more — plain text.
                self.lead_decided = true;
                self.open_block(out, Block::Text);
                let rest = std::mem::take(&mut self.lead);
                self.emit_text_delta(&rest, out);
            }
            // Still a strict prefix of "<thinking>": keep buffering.
            return;
        }
        match self.block {
            Block::Thinking => self.push_thinking(content, out),
            Block::Text => self.emit_text_delta(content, out),
            Block::None | Block::Tool => {
                self.close_block(out);
                self.open_block(out, Block::Text);
                self.emit_text_delta(content, out);
            }
        }
    }

    /// Inside a thinking block: watch for the closing tag, which may be split
    /// across frames.
    fn push_thinking(&mut self, content: &str, out: &mut String) {
        self.thinking_tail.push_str(content);
        if let Some(pos) = self.thinking_tail.find(THINKING_CLOSE) {
            let before = self.thinking_tail[..pos].to_string();
            let after = self.thinking_tail[pos + THINKING_CLOSE.len()..].to_string();
            self.thinking_tail.clear();
            if !before.is_empty() {
                self.emit_thinking_delta(&before, out);
            }
            self.close_block(out);
            self.open_block(out, Block::Text);
            if !after.is_empty() {
                self.emit_text_delta(&after, out);
            }
            return;
        }
        // Keep a potential partial closing tag buffered; flush the rest.
        let keep = THINKING_CLOSE.len() - 1;
        if self.thinking_tail.len() > keep {
            let flush_to = self.thinking_tail.len() - keep;
            let split = floor_char_boundary(&self.thinking_tail, flush_to);
            if split > 0 {
                let flushed: String = self.thinking_tail.drain(..split).collect();
                self.emit_thinking_delta(&flushed, out);
            }
        }
    }

    fn flush_lead(&mut self, out: &mut String) {
        if !self.lead_decided && !self.lead.is_empty() {
            self.lead_decided = true;
            self.open_block(out, Block::Text);
            let rest = std::mem::take(&mut self.lead);
            self.emit_text_delta(&rest, out);
        }
    }

    fn flush_thinking_tail(&mut self, out: &mut String) {
        if self.block == Block::Thinking && !self.thinking_tail.is_empty() {
            let rest = std::mem::take(&mut self.thinking_tail);
            self.emit_thinking_delta(&rest, out);
        }
    }

    fn open_block(&mut self, out: &mut String, block: Block) {
        let content_block = match block {
            Block::Thinking => json!({ "type": "thinking", "thinking": "" }),
            _ => json!({ "type": "text", "text": "" }),
        };
        self.emit_event(
            out,
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        );
        self.block = block;
    }

    fn close_block(&mut self, out: &mut String) {
        if self.block == Block::None {
            return;
        }
        self.emit_event(
            out,
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        );
        self.block = Block::None;
        self.block_index += 1;
    }

    fn emit_text_delta(&mut self, text: &str, out: &mut String) {
        if self.block != Block::Text {
            self.open_block(out, Block::Text);
        }
        self.emitted_chars += text.chars().count();
        self.emit_event(
            out,
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "text_delta", "text": text },
            }),
        );
    }

    fn emit_thinking_delta(&mut self, text: &str, out: &mut String) {
        self.emitted_chars += text.chars().count();
        self.emit_event(
            out,
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "thinking_delta", "thinking": text },
            }),
        );
    }

    fn emit_stop(&mut self, out: &mut String, stop_reason: &str) {
        // Fall back to the ASCII char ratio when no metering frame arrived.
        let output_tokens = self
            .metered_output
            .unwrap_or_else(|| (self.emitted_chars as f64 / 4.0).ceil() as i64);
        self.emit_event(
            out,
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": output_tokens },
            }),
        );
        self.emit_event(out, "message_stop", json!({ "type": "message_stop" }));
        self.done = true;
    }

    fn emit_event(&self, out: &mut String, event: &str, data: Value) {
        out.push_str(&format!("event: {event}\ndata: {data}\n\n"));
    }
}

/// Largest byte index ≤ `index` that is a char boundary.
fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
