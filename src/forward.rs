//! Single-attempt forward engine.
//!
//! One call = one upstream HTTP exchange: build the request from the
//! adapter's [`PreparedRequest`], enforce the attempt deadlines, classify
//! transport failures into synthetic statuses, and on success either buffer
//! the body (non-streaming) or hand back a tapped byte stream (streaming).
//!
//! The streaming tap is a pump task: upstream chunks pass through the
//! adapter's response translator, feed the usage parser, and are pushed to a
//! bounded channel the HTTP layer drains into the client response. When the
//! client goes away the channel send fails and the pump drops the upstream
//! response immediately — on HTTP/2 that resets the stream so the upstream
//! stops generating. The pump ends by invoking a finish callback with the
//! parse summary so the retry driver can log and cool down after the fact.

use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::adapters::{
    CodexSseTranslator, GeminiCliUnwrapper, KiroEventStreamTranslator, PreparedRequest,
    ResponseKind,
};
use crate::config::UpstreamConfig;
use crate::cooldown::AttemptOutcome;
use crate::error::ProxyError;
use crate::usage::{ParseSummary, UsageParser};

/// Cap on how much of an upstream *error* body is read back.
const ERROR_BODY_CAP: usize = 1024 * 1024;

/// Streaming channel depth; small so client backpressure reaches upstream.
const STREAM_BUFFER: usize = 16;

/// Shared process-wide HTTP clients, built once at boot.
///
/// `buffered` carries the total deadline for non-streaming attempts;
/// `streaming` has no request-level timeout because the body arrives
/// incrementally. Both share connect timeout, TCP_NODELAY, and per-host
/// connection caps; proxies follow `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
#[derive(Clone)]
pub struct HttpClients {
    pub buffered: reqwest::Client,
    pub streaming: reqwest::Client,
}

impl HttpClients {
    pub fn build(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let base = || {
            reqwest::Client::builder()
                .tcp_nodelay(true)
                .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
                .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
        };
        Ok(Self {
            buffered: base().timeout(Duration::from_secs(cfg.total_timeout_secs)).build()?,
            streaming: base().build()?,
        })
    }
}

/// Headers that must not be copied between client and upstream.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Client request headers safe to forward upstream: hop-by-hop, auth and
/// framing headers are dropped (auth is re-injected by the adapter).
pub fn filter_client_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if matches!(
            name.as_str(),
            "host" | "content-length" | "authorization" | "x-api-key" | "accept-encoding"
        ) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Upstream response headers safe to relay to the client.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.as_str() == "content-length" {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Adapter-selected response post-processing, applied chunk by chunk.
pub enum ResponseTranslator {
    None,
    Codex(CodexSseTranslator),
    GeminiCli(GeminiCliUnwrapper),
    Kiro(KiroEventStreamTranslator),
}

impl ResponseTranslator {
    pub fn from_kind(kind: &ResponseKind, model: &str) -> Self {
        match kind {
            ResponseKind::Passthrough => Self::None,
            ResponseKind::CodexToChat => Self::Codex(CodexSseTranslator::new()),
            ResponseKind::GeminiCliUnwrap => Self::GeminiCli(GeminiCliUnwrapper::new()),
            ResponseKind::KiroEventStream { estimated_input_tokens } => {
                Self::Kiro(KiroEventStreamTranslator::new(model, *estimated_input_tokens))
            }
        }
    }

    fn transform(&mut self, chunk: &[u8]) -> Vec<u8> {
        match self {
            Self::None => chunk.to_vec(),
            Self::Codex(t) => t.transform(chunk),
            Self::GeminiCli(t) => t.transform(chunk),
            Self::Kiro(t) => t.transform(chunk),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Codex(t) => t.finish(),
            Self::GeminiCli(t) => t.finish(),
            Self::Kiro(t) => t.finish(),
        }
    }
}

/// End-of-stream report delivered to the driver's finish callback.
pub struct StreamEnd {
    pub summary: ParseSummary,
    /// The client went away before the upstream finished.
    pub canceled: bool,
    /// Bytes pushed toward the client before the stream ended.
    pub bytes_sent: usize,
}

pub type FinishCallback = Box<dyn FnOnce(StreamEnd) + Send + 'static>;

/// A successful attempt, ready to be answered to the client.
pub enum AttemptReply {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        summary: ParseSummary,
        first_byte_ms: i64,
    },
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        body_rx: mpsc::Receiver<Bytes>,
        first_byte_ms: i64,
    },
}

/// A failed attempt plus the classifier's view of it.
pub struct AttemptFailure {
    pub error: ProxyError,
    pub outcome: AttemptOutcome,
}

impl AttemptFailure {
    fn from_error(error: ProxyError) -> Self {
        let mut outcome = AttemptOutcome::new(error.wire_status(), error.to_string());
        outcome.network_error = error.is_network();
        Self { error, outcome }
    }
}

pub struct ForwardEngine {
    clients: HttpClients,
    cfg: UpstreamConfig,
}

impl ForwardEngine {
    pub fn new(clients: HttpClients, cfg: UpstreamConfig) -> Self {
        Self { clients, cfg }
    }

    /// Execute one upstream attempt.
    ///
    /// `finish` fires exactly once for streaming replies, after the last byte
    /// (or cancellation); buffered replies report their summary inline and
    /// never invoke it.
    pub async fn attempt(
        &self,
        method: Method,
        prepared: PreparedRequest,
        client_headers: &HeaderMap,
        streaming: bool,
        kind: &ResponseKind,
        model: &str,
        finish: FinishCallback,
    ) -> Result<AttemptReply, AttemptFailure> {
        let client = if streaming { &self.clients.streaming } else { &self.clients.buffered };

        let mut headers = filter_client_headers(client_headers);
        for (name, value) in &prepared.headers {
            headers.insert(name.clone(), value.clone());
        }

        let request = client
            .request(method, &prepared.url)
            .headers(headers)
            .body(prepared.body);

        let started = Instant::now();
        let send = request.send();

        // First-byte deadline applies only to attempts that are streaming at
        // dispatch time; non-streaming attempts ride the client's total
        // timeout instead.
        let response = if streaming && self.cfg.first_byte_timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(self.cfg.first_byte_timeout_ms),
                send,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(AttemptFailure::from_error(ProxyError::UpstreamTimeout {
                        first_byte: true,
                    }))
                }
            }
        } else {
            send.await
        };

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(AttemptFailure::from_error(ProxyError::UpstreamTimeout {
                    first_byte: false,
                }))
            }
            Err(e) => {
                return Err(AttemptFailure::from_error(ProxyError::UpstreamTransport(
                    e.to_string(),
                )))
            }
        };

        let first_byte_ms = started.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let response_headers = response.headers().clone();
            let body = read_capped(response, ERROR_BODY_CAP).await;
            let body_text = String::from_utf8_lossy(&body).to_string();
            let mut outcome = AttemptOutcome::new(status.as_u16(), body_text.clone());
            outcome.headers = response_headers;
            return Err(AttemptFailure {
                error: ProxyError::UpstreamHttpError { status: status.as_u16(), body: body_text },
                outcome,
            });
        }

        if response.content_length() == Some(0) {
            return Err(AttemptFailure::from_error(ProxyError::EmptyOkResponse));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let response_headers = filter_response_headers(response.headers());
        let translator = ResponseTranslator::from_kind(kind, model);
        // The Kiro translator rewrites the binary EventStream into SSE; the
        // relayed content type must follow.
        let (response_headers, parser) = match kind {
            ResponseKind::KiroEventStream { .. } => {
                let mut h = response_headers;
                h.insert(header::CONTENT_TYPE, "text/event-stream".parse().expect("static value"));
                (h, UsageParser::sse())
            }
            _ => {
                let p = UsageParser::for_content_type(&content_type, streaming);
                (response_headers, p)
            }
        };

        if streaming {
            let body_rx = spawn_pump(response, translator, parser, finish);
            Ok(AttemptReply::Streaming {
                status,
                headers: response_headers,
                body_rx,
                first_byte_ms,
            })
        } else {
            let (body, summary) = buffer_body(response, translator, parser).await?;
            Ok(AttemptReply::Buffered {
                status,
                headers: response_headers,
                body,
                summary,
                first_byte_ms,
            })
        }
    }
}

async fn read_capped(mut response: reqwest::Response, cap: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        let room = cap.saturating_sub(out.len());
        if room == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    out
}

/// Read a whole non-streaming body through the translator and parser.
///
/// A body error after some bytes arrived is treated as success with what was
/// received (HTTP/2 "response body closed" behavior); an error before any
/// byte is a transport failure.
async fn buffer_body(
    mut response: reqwest::Response,
    mut translator: ResponseTranslator,
    mut parser: UsageParser,
) -> Result<(Bytes, ParseSummary), AttemptFailure> {
    let mut out: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let translated = translator.transform(&chunk);
                parser.feed(&translated);
                out.extend_from_slice(&translated);
            }
            Ok(None) => break,
            Err(e) => {
                if out.is_empty() {
                    return Err(AttemptFailure::from_error(ProxyError::UpstreamTransport(
                        e.to_string(),
                    )));
                }
                tracing::debug!(error = %e, "body closed early after partial read — keeping bytes");
                break;
            }
        }
    }
    let tail = translator.finish();
    parser.feed(&tail);
    out.extend_from_slice(&tail);

    if out.is_empty() {
        return Err(AttemptFailure::from_error(ProxyError::EmptyOkResponse));
    }
    Ok((Bytes::from(out), parser.finish()))
}

/// Spawn the streaming pump; see module docs for the cancellation contract.
fn spawn_pump(
    mut response: reqwest::Response,
    mut translator: ResponseTranslator,
    mut parser: UsageParser,
    finish: FinishCallback,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);

    tokio::spawn(async move {
        let mut canceled = false;
        let mut bytes_sent = 0usize;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let translated = translator.transform(&chunk);
                    parser.feed(&translated);
                    if translated.is_empty() {
                        continue;
                    }
                    bytes_sent += translated.len();
                    if tx.send(Bytes::from(translated)).await.is_err() {
                        canceled = true;
                        break;
                    }
                }
                Ok(None) => {
                    let tail = translator.finish();
                    if !tail.is_empty() {
                        parser.feed(&tail);
                        bytes_sent += tail.len();
                        let _ = tx.send(Bytes::from(tail)).await;
                    }
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "upstream stream error — ending relay");
                    break;
                }
            }
        }

        // Dropping `response` here closes the upstream body; on cancellation
        // this is what stops the upstream from generating further tokens.
        drop(response);
        finish(StreamEnd { summary: parser.finish(), canceled, bytes_sent });
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> ForwardEngine {
        let cfg: UpstreamConfig = toml::from_str("").unwrap();
        ForwardEngine::new(HttpClients::build(&cfg).unwrap(), cfg)
    }

    fn engine_with_first_byte_ms(ms: u64) -> ForwardEngine {
        let cfg: UpstreamConfig =
            toml::from_str(&format!("first_byte_timeout_ms = {ms}")).unwrap();
        ForwardEngine::new(HttpClients::build(&cfg).unwrap(), cfg)
    }

    fn prepared(url: String) -> PreparedRequest {
        PreparedRequest { url, body: b"{}".to_vec(), headers: HeaderMap::new() }
    }

    fn noop_finish() -> FinishCallback {
        Box::new(|_| {})
    }

    fn capture_finish() -> (FinishCallback, Arc<Mutex<Option<StreamEnd>>>) {
        let slot: Arc<Mutex<Option<StreamEnd>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        (Box::new(move |end| *out.lock().unwrap() = Some(end)), slot)
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    const SSE_BODY: &str = "\
event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":11}}}\n\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n\
data: {\"type\":\"message_stop\"}\n\n";

    // -----------------------------------------------------------------------
    // Failure classification
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn non_2xx_returns_failure_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = engine()
            .attempt(
                Method::POST,
                prepared(format!("{}/v1/messages", server.uri())),
                &HeaderMap::new(),
                false,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await
            .err()
            .expect("should fail");

        assert!(matches!(err.error, ProxyError::UpstreamHttpError { status: 529, .. }));
        assert_eq!(err.outcome.status, 529);
        assert_eq!(err.outcome.body, "overloaded");
    }

    #[tokio::test]
    async fn empty_200_is_synthetic_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(Vec::<u8>::new(), "application/json"))
            .mount(&server)
            .await;

        let err = engine()
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                false,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await
            .err()
            .expect("should fail");

        assert!(matches!(err.error, ProxyError::EmptyOkResponse));
        assert_eq!(err.outcome.status, crate::error::STATUS_EMPTY_OK);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let err = engine()
            .attempt(
                Method::POST,
                prepared("http://127.0.0.1:1/unreachable".into()),
                &HeaderMap::new(),
                false,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await
            .err()
            .expect("should fail");

        assert!(matches!(err.error, ProxyError::UpstreamTransport(_)));
        assert!(err.outcome.network_error);
    }

    #[tokio::test]
    async fn first_byte_timeout_fires_for_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_string("late"),
            )
            .mount(&server)
            .await;

        let err = engine_with_first_byte_ms(50)
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                true,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await
            .err()
            .expect("should time out");

        assert!(matches!(err.error, ProxyError::UpstreamTimeout { first_byte: true }));
        assert_eq!(err.outcome.status, crate::error::STATUS_FIRST_BYTE_TIMEOUT);
    }

    #[tokio::test]
    async fn first_byte_timer_disabled_for_non_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(200))
                    .set_body_json(serde_json::json!({"usage": {"input_tokens": 1, "output_tokens": 1}})),
            )
            .mount(&server)
            .await;

        // 50 ms first-byte budget, but the attempt is non-streaming.
        let reply = engine_with_first_byte_ms(50)
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                false,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await;
        assert!(reply.is_ok());
    }

    // -----------------------------------------------------------------------
    // Buffered success
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn buffered_reply_carries_body_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 9, "output_tokens": 4},
            })))
            .mount(&server)
            .await;

        let reply = engine()
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                false,
                &ResponseKind::Passthrough,
                "m",
                noop_finish(),
            )
            .await
            .ok()
            .expect("should succeed");

        match reply {
            AttemptReply::Buffered { status, body, summary, .. } => {
                assert_eq!(status, StatusCode::OK);
                assert!(!body.is_empty());
                assert_eq!(summary.counters.input_tokens, 9);
                assert_eq!(summary.counters.output_tokens, 4);
                assert!(summary.stream_complete);
            }
            AttemptReply::Streaming { .. } => panic!("expected buffered reply"),
        }
    }

    // -----------------------------------------------------------------------
    // Streaming success
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_reply_relays_bytes_and_reports_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
            .mount(&server)
            .await;

        let (finish, slot) = capture_finish();
        let reply = engine()
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                true,
                &ResponseKind::Passthrough,
                "m",
                finish,
            )
            .await
            .ok()
            .expect("should succeed");

        let AttemptReply::Streaming { status, body_rx, .. } = reply else {
            panic!("expected streaming reply");
        };
        assert_eq!(status, StatusCode::OK);
        let bytes = drain(body_rx).await;
        assert_eq!(String::from_utf8_lossy(&bytes), SSE_BODY);

        let end = slot.lock().unwrap().take().expect("finish must fire");
        assert!(end.summary.stream_complete);
        assert!(!end.canceled);
        assert_eq!(end.summary.counters.input_tokens, 11);
        assert_eq!(end.summary.counters.output_tokens, 7);
        assert_eq!(end.bytes_sent, SSE_BODY.len());
    }

    #[tokio::test]
    async fn stream_without_sentinel_reports_incomplete() {
        let server = MockServer::start().await;
        let truncated = &SSE_BODY[..SSE_BODY.find("data: {\"type\":\"message_stop\"}").unwrap()];
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(truncated, "text/event-stream"))
            .mount(&server)
            .await;

        let (finish, slot) = capture_finish();
        let reply = engine()
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                true,
                &ResponseKind::Passthrough,
                "m",
                finish,
            )
            .await
            .ok()
            .expect("headers were 200");

        let AttemptReply::Streaming { body_rx, .. } = reply else {
            panic!("expected streaming reply");
        };
        drain(body_rx).await;

        let end = slot.lock().unwrap().take().expect("finish must fire");
        assert!(!end.summary.stream_complete);
        assert!(!end.canceled);
    }

    #[tokio::test]
    async fn dropping_receiver_cancels_pump() {
        let server = MockServer::start().await;
        // Large body so the pump outlives the receiver drop.
        let big = "data: {\"x\":1}\n\n".repeat(200_000);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(big, "text/event-stream"))
            .mount(&server)
            .await;

        let (finish, slot) = capture_finish();
        let reply = engine()
            .attempt(
                Method::POST,
                prepared(server.uri()),
                &HeaderMap::new(),
                true,
                &ResponseKind::Passthrough,
                "m",
                finish,
            )
            .await
            .ok()
            .expect("should start streaming");

        let AttemptReply::Streaming { mut body_rx, .. } = reply else {
            panic!("expected streaming reply");
        };
        // Read one chunk, then walk away.
        let _ = body_rx.recv().await;
        drop(body_rx);

        // The pump notices the closed channel on its next send.
        for _ in 0..100 {
            if slot.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let end = slot.lock().unwrap().take().expect("finish must fire after cancel");
        assert!(end.canceled);
    }

    // -----------------------------------------------------------------------
    // Header filtering
    // -----------------------------------------------------------------------

    #[test]
    fn hop_by_hop_and_auth_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer client-token".parse().unwrap());
        headers.insert("x-api-key", "sk-client".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("anthropic-beta", "prompt-caching-2024-07-31".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        let filtered = filter_client_headers(&headers);
        assert!(filtered.get("authorization").is_none());
        assert!(filtered.get("x-api-key").is_none());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert_eq!(filtered.get("anthropic-beta").unwrap(), "prompt-caching-2024-07-31");
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn response_content_length_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "42".parse().unwrap());
        headers.insert("content-type", "text/event-stream".parse().unwrap());
        let filtered = filter_response_headers(&headers);
        assert!(filtered.get("content-length").is_none());
        assert!(filtered.get("content-type").is_some());
    }
}
