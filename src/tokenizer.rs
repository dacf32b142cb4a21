//! Local token estimation.
//!
//! Backs `POST /v1/messages/count_tokens` and the Kiro adapter's input-side
//! accounting (CodeWhisperer does not report input tokens). Two local tiers:
//!
//! 1. BPE count via `tiktoken-rs` (`o200k_base`) — close enough across
//!    providers for accounting purposes;
//! 2. character-ratio fallback (≈4 chars/token for ASCII text, ≈1.5 for CJK)
//!    when the BPE ranks are unavailable.
//!
//! Tool definitions are charged their serialized JSON cost plus a fixed
//! per-tool framing constant.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Fixed per-tool framing overhead, in tokens.
const PER_TOOL_OVERHEAD: i64 = 8;

fn bpe() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

/// Character-ratio estimate: CJK scripts run much denser than ASCII.
pub fn estimate_text_tokens(text: &str) -> i64 {
    let mut ascii_like = 0usize;
    let mut cjk = 0usize;
    for ch in text.chars() {
        let code = ch as u32;
        // CJK unified ideographs, Hiragana/Katakana, Hangul syllables.
        if (0x4E00..=0x9FFF).contains(&code)
            || (0x3400..=0x4DBF).contains(&code)
            || (0x3040..=0x30FF).contains(&code)
            || (0xAC00..=0xD7AF).contains(&code)
        {
            cjk += 1;
        } else {
            ascii_like += 1;
        }
    }
    let ascii_tokens = (ascii_like as f64 / 4.0).ceil() as i64;
    let cjk_tokens = (cjk as f64 / 1.5).ceil() as i64;
    ascii_tokens + cjk_tokens
}

/// BPE count with char-ratio fallback.
pub fn count_text_tokens(text: &str) -> i64 {
    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as i64,
        None => estimate_text_tokens(text),
    }
}

/// Flatten an Anthropic `content` value (string or block list) to its text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                b["text"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| b["content"].as_str().map(str::to_string))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Token estimate for a whole Anthropic Messages request body: system prompt,
/// messages, and tool definitions.
pub fn count_request_tokens(body: &Value) -> i64 {
    let mut total = 0i64;

    match body.get("system") {
        Some(Value::String(s)) => total += count_text_tokens(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block["text"].as_str() {
                    total += count_text_tokens(text);
                }
            }
        }
        _ => {}
    }

    if let Some(messages) = body["messages"].as_array() {
        for msg in messages {
            total += count_text_tokens(&content_text(&msg["content"]));
            // Role and block framing.
            total += 4;
        }
    }

    if let Some(tools) = body["tools"].as_array() {
        for tool in tools {
            total += PER_TOOL_OVERHEAD;
            total += count_text_tokens(&tool.to_string());
        }
    }

    total.max(1)
}
