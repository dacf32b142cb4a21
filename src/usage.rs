//! Usage extraction from upstream response bodies.
//!
//! While the forward engine streams a response to the client it feeds every
//! chunk to one of these parsers, which accumulate token counters and track
//! whether the stream ended with a completion sentinel. Parsing is strictly
//! incremental and line-buffered, so any byte-level re-chunking of the same
//! stream yields identical results.
//!
//! Recognized shapes:
//!
//! | Source | Counters | Sentinel |
//! |---|---|---|
//! | Anthropic SSE | `message_start.message.usage`, `message_delta.usage` | `message_stop` |
//! | OpenAI chat SSE | final chunk `usage` | `[DONE]` |
//! | Codex Responses SSE | `response.completed.response.usage` | `response.completed` |
//! | Gemini SSE/JSON | `usageMetadata` | `finishReason` present |

use serde_json::Value;

/// Token counters accumulated from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

/// Final verdict of a parser once the body is finished.
#[derive(Debug, Clone, Default)]
pub struct ParseSummary {
    pub counters: UsageCounters,
    /// A completion sentinel was observed.
    pub stream_complete: bool,
    /// The stream carried an error event instead of content (SSE-embedded
    /// error) — counts as a failed attempt even though HTTP said 200.
    pub embedded_error: Option<String>,
}

/// Drain complete lines out of `buffer` after appending `chunk`, tolerating
/// CRLF and chunk boundaries that split lines.
fn drain_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Line-oriented SSE usage parser.
#[derive(Debug, Default)]
pub struct SseUsageParser {
    buffer: Vec<u8>,
    counters: UsageCounters,
    complete: bool,
    embedded_error: Option<String>,
    saw_data: bool,
}

impl SseUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        for line in drain_lines(&mut self.buffer, chunk) {
            self.handle_line(&line);
        }
    }

    /// Flush a trailing unterminated line and return the verdict.
    pub fn finish(mut self) -> ParseSummary {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).to_string();
            self.handle_line(&line);
        }
        ParseSummary {
            counters: self.counters,
            stream_complete: self.complete,
            embedded_error: self.embedded_error,
        }
    }

    fn handle_line(&mut self, line: &str) {
        // `event:` lines carry no counters; completion and errors are
        // re-stated in the data payloads we parse below.
        let Some(data) = sse_data(line) else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.complete = true;
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.absorb_event(&value);
    }

    fn absorb_event(&mut self, value: &Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.merge_anthropic_usage(&value["message"]["usage"]);
            }
            Some("message_delta") => {
                self.merge_anthropic_usage(&value["usage"]);
            }
            Some("message_stop") => {
                self.complete = true;
            }
            Some("response.completed") => {
                let usage = &value["response"]["usage"];
                if let Some(n) = usage["input_tokens"].as_i64() {
                    self.counters.input_tokens = n;
                }
                if let Some(n) = usage["output_tokens"].as_i64() {
                    self.counters.output_tokens = n;
                }
                if let Some(n) = usage["input_tokens_details"]["cached_tokens"].as_i64() {
                    self.counters.cache_read_tokens = n;
                }
                self.complete = true;
            }
            Some("error") => {
                if self.embedded_error.is_none() && !self.saw_data {
                    self.embedded_error = Some(
                        value["error"]["message"]
                            .as_str()
                            .unwrap_or("upstream stream error")
                            .to_string(),
                    );
                }
                self.complete = true;
            }
            _ => {
                // OpenAI chat chunks and Gemini frames carry no `type` tag.
                if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
                    if let Some(n) = usage["prompt_tokens"].as_i64() {
                        self.counters.input_tokens = n;
                    }
                    if let Some(n) = usage["completion_tokens"].as_i64() {
                        self.counters.output_tokens = n;
                    }
                    if let Some(n) = usage["prompt_tokens_details"]["cached_tokens"].as_i64() {
                        self.counters.cache_read_tokens = n;
                    }
                }
                if let Some(meta) = value.get("usageMetadata") {
                    self.merge_gemini_usage(meta);
                }
                if value
                    .pointer("/candidates/0/finishReason")
                    .and_then(Value::as_str)
                    .is_some()
                {
                    self.complete = true;
                }
            }
        }
        self.saw_data = true;
    }

    fn merge_anthropic_usage(&mut self, usage: &Value) {
        if let Some(n) = usage["input_tokens"].as_i64() {
            self.counters.input_tokens = n;
        }
        if let Some(n) = usage["output_tokens"].as_i64() {
            self.counters.output_tokens = n;
        }
        if let Some(n) = usage["cache_read_input_tokens"].as_i64() {
            self.counters.cache_read_tokens = n;
        }
        if let Some(n) = usage["cache_creation_input_tokens"].as_i64() {
            self.counters.cache_creation_tokens = n;
        }
    }

    fn merge_gemini_usage(&mut self, meta: &Value) {
        if let Some(n) = meta["promptTokenCount"].as_i64() {
            self.counters.input_tokens = n;
        }
        if let Some(n) = meta["candidatesTokenCount"].as_i64() {
            self.counters.output_tokens = n;
        }
        if let Some(n) = meta["cachedContentTokenCount"].as_i64() {
            self.counters.cache_read_tokens = n;
        }
    }
}

/// Whole-body JSON parser for non-SSE responses.
#[derive(Debug, Default)]
pub struct JsonUsageParser {
    body: Vec<u8>,
}

/// Bytes beyond this are ignored for usage purposes (the client still gets
/// the full body — this cap only bounds parser memory).
const JSON_BODY_CAP: usize = 2 * 1024 * 1024;

impl JsonUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let room = JSON_BODY_CAP.saturating_sub(self.body.len());
        self.body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn finish(self) -> ParseSummary {
        let mut counters = UsageCounters::default();
        let Ok(value) = serde_json::from_slice::<Value>(&self.body) else {
            return ParseSummary { counters, stream_complete: false, embedded_error: None };
        };

        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            // Anthropic and OpenAI shapes share the `usage` key.
            counters.input_tokens = usage["input_tokens"]
                .as_i64()
                .or_else(|| usage["prompt_tokens"].as_i64())
                .unwrap_or(0);
            counters.output_tokens = usage["output_tokens"]
                .as_i64()
                .or_else(|| usage["completion_tokens"].as_i64())
                .unwrap_or(0);
            counters.cache_read_tokens = usage["cache_read_input_tokens"]
                .as_i64()
                .or_else(|| usage["prompt_tokens_details"]["cached_tokens"].as_i64())
                .unwrap_or(0);
            counters.cache_creation_tokens =
                usage["cache_creation_input_tokens"].as_i64().unwrap_or(0);
        } else if let Some(meta) = value.get("usageMetadata") {
            counters.input_tokens = meta["promptTokenCount"].as_i64().unwrap_or(0);
            counters.output_tokens = meta["candidatesTokenCount"].as_i64().unwrap_or(0);
            counters.cache_read_tokens = meta["cachedContentTokenCount"].as_i64().unwrap_or(0);
        }

        // A parseable JSON body is a complete (non-streaming) response.
        ParseSummary { counters, stream_complete: true, embedded_error: None }
    }
}

/// Peek size for [`UsageParser::Probed`] before committing to a format.
const PROBE_CAP: usize = 2048;

/// Unified parser handle held by the forward engine.
#[derive(Debug)]
pub enum UsageParser {
    Sse(SseUsageParser),
    Json(JsonUsageParser),
    /// Content-Type said `text/plain` but the client asked for streaming:
    /// buffer up to 2 KB, then decide by looking at the bytes.
    Probed { pending: Vec<u8>, decided: Option<Box<UsageParser>> },
}

impl UsageParser {
    pub fn sse() -> Self {
        Self::Sse(SseUsageParser::new())
    }

    pub fn json() -> Self {
        Self::Json(JsonUsageParser::new())
    }

    pub fn probed() -> Self {
        Self::Probed { pending: Vec::new(), decided: None }
    }

    /// Pick a parser from the response Content-Type and the client's
    /// streaming intent.
    pub fn for_content_type(content_type: &str, client_streaming: bool) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("text/event-stream") {
            Self::sse()
        } else if client_streaming && ct.contains("text/plain") {
            Self::probed()
        } else {
            Self::json()
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        match self {
            Self::Sse(p) => p.feed(chunk),
            Self::Json(p) => p.feed(chunk),
            Self::Probed { pending, decided } => {
                if let Some(inner) = decided {
                    inner.feed(chunk);
                    return;
                }
                pending.extend_from_slice(chunk);
                if pending.len() >= PROBE_CAP {
                    let inner = Self::decide(std::mem::take(pending));
                    *decided = Some(Box::new(inner));
                }
            }
        }
    }

    pub fn finish(self) -> ParseSummary {
        match self {
            Self::Sse(p) => p.finish(),
            Self::Json(p) => p.finish(),
            Self::Probed { pending, decided } => match decided {
                Some(inner) => inner.finish(),
                None => Self::decide(pending).finish(),
            },
        }
    }

    fn decide(buffered: Vec<u8>) -> UsageParser {
        let head = String::from_utf8_lossy(&buffered);
        let looks_like_sse = head
            .lines()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.starts_with("data:") || l.starts_with("event:"));
        let mut inner = if looks_like_sse { Self::sse() } else { Self::json() };
        inner.feed(&buffered);
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANTHROPIC_STREAM: &str = "\
event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"cache_read_input_tokens\":10}}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\
\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\
\n";

    fn parse_whole(input: &str) -> ParseSummary {
        let mut p = SseUsageParser::new();
        p.feed(input.as_bytes());
        p.finish()
    }

    // -----------------------------------------------------------------------
    // Anthropic SSE
    // -----------------------------------------------------------------------

    #[test]
    fn anthropic_stream_counters_and_sentinel() {
        let summary = parse_whole(ANTHROPIC_STREAM);
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.input_tokens, 25);
        assert_eq!(summary.counters.output_tokens, 42);
        assert_eq!(summary.counters.cache_read_tokens, 10);
        assert!(summary.embedded_error.is_none());
    }

    #[test]
    fn missing_sentinel_reports_incomplete() {
        let truncated = &ANTHROPIC_STREAM[..ANTHROPIC_STREAM.find("event: message_stop").unwrap()];
        let summary = parse_whole(truncated);
        assert!(!summary.stream_complete);
        assert_eq!(summary.counters.output_tokens, 42);
    }

    #[test]
    fn byte_split_permutations_agree() {
        // Any re-chunking of the same stream must produce the same
        // (input, output, complete) triple.
        let bytes = ANTHROPIC_STREAM.as_bytes();
        let reference = parse_whole(ANTHROPIC_STREAM);
        for chunk_size in [1usize, 2, 3, 7, 16, 64, 1024] {
            let mut p = SseUsageParser::new();
            for chunk in bytes.chunks(chunk_size) {
                p.feed(chunk);
            }
            let summary = p.finish();
            assert_eq!(summary.counters, reference.counters, "chunk size {chunk_size}");
            assert_eq!(summary.stream_complete, reference.stream_complete);
        }
    }

    // -----------------------------------------------------------------------
    // OpenAI / Codex / Gemini SSE
    // -----------------------------------------------------------------------

    #[test]
    fn openai_chat_stream_with_done_sentinel() {
        let stream = "\
data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":34}}\n\n\
data: [DONE]\n\n";
        let summary = parse_whole(stream);
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.input_tokens, 12);
        assert_eq!(summary.counters.output_tokens, 34);
    }

    #[test]
    fn codex_response_completed_carries_usage_and_completes() {
        let stream = "\
data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n\
data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":100,\"output_tokens\":7,\"input_tokens_details\":{\"cached_tokens\":60}}}}\n\n";
        let summary = parse_whole(stream);
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.input_tokens, 100);
        assert_eq!(summary.counters.output_tokens, 7);
        assert_eq!(summary.counters.cache_read_tokens, 60);
    }

    #[test]
    fn gemini_usage_metadata_and_finish_reason() {
        let stream = "\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n\
data: {\"candidates\":[{\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":9,\"candidatesTokenCount\":21}}\n\n";
        let summary = parse_whole(stream);
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.input_tokens, 9);
        assert_eq!(summary.counters.output_tokens, 21);
    }

    // -----------------------------------------------------------------------
    // Embedded errors
    // -----------------------------------------------------------------------

    #[test]
    fn leading_error_event_is_embedded_error() {
        let stream = "\
event: error\n\
data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let summary = parse_whole(stream);
        assert_eq!(summary.embedded_error.as_deref(), Some("Overloaded"));
    }

    #[test]
    fn error_after_content_is_not_embedded_error() {
        let stream = "\
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":1}}}\n\n\
data: {\"type\":\"error\",\"error\":{\"message\":\"mid-stream failure\"}}\n\n";
        let summary = parse_whole(stream);
        assert!(summary.embedded_error.is_none());
    }

    // -----------------------------------------------------------------------
    // JSON parser
    // -----------------------------------------------------------------------

    #[test]
    fn json_anthropic_body() {
        let mut p = JsonUsageParser::new();
        p.feed(br#"{"content":[{"type":"text","text":"Hi"}],"usage":{"input_tokens":5,"output_tokens":6,"cache_creation_input_tokens":2}}"#);
        let summary = p.finish();
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.input_tokens, 5);
        assert_eq!(summary.counters.output_tokens, 6);
        assert_eq!(summary.counters.cache_creation_tokens, 2);
    }

    #[test]
    fn json_gemini_body() {
        let mut p = JsonUsageParser::new();
        p.feed(br#"{"candidates":[],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":4}}"#);
        let summary = p.finish();
        assert_eq!(summary.counters.input_tokens, 3);
        assert_eq!(summary.counters.output_tokens, 4);
    }

    #[test]
    fn unparseable_json_is_incomplete() {
        let mut p = JsonUsageParser::new();
        p.feed(b"<!doctype html>");
        assert!(!p.finish().stream_complete);
    }

    // -----------------------------------------------------------------------
    // Probed parser
    // -----------------------------------------------------------------------

    #[test]
    fn probe_detects_sse_despite_text_plain() {
        let mut p = UsageParser::for_content_type("text/plain; charset=utf-8", true);
        p.feed(ANTHROPIC_STREAM.as_bytes());
        let summary = p.finish();
        assert!(summary.stream_complete);
        assert_eq!(summary.counters.output_tokens, 42);
    }

    #[test]
    fn probe_falls_back_to_json() {
        let mut p = UsageParser::for_content_type("text/plain", true);
        p.feed(br#"{"usage":{"input_tokens":8,"output_tokens":9}}"#);
        let summary = p.finish();
        assert_eq!(summary.counters.input_tokens, 8);
        assert_eq!(summary.counters.output_tokens, 9);
    }

    #[test]
    fn content_type_selects_parser() {
        assert!(matches!(UsageParser::for_content_type("text/event-stream", true), UsageParser::Sse(_)));
        assert!(matches!(UsageParser::for_content_type("application/json", false), UsageParser::Json(_)));
        assert!(matches!(UsageParser::for_content_type("text/plain", true), UsageParser::Probed { .. }));
        assert!(matches!(UsageParser::for_content_type("text/plain", false), UsageParser::Json(_)));
    }
}
