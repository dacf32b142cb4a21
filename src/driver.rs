//! Retry driver — the outer channel loop and inner credential loop around
//! the forward engine.
//!
//! One client request fans out over the selector's candidate list: for each
//! channel, up to `min(max_key_retries, credential_count)` credentials are
//! tried; every failed attempt is classified by the cooldown manager, whose
//! action decides between the next credential, the next channel, or
//! surfacing to the client. Accounting is enqueued at every terminal
//! outcome.
//!
//! Two invariants hold unconditionally: a channel never serves more
//! credentials than the cap, and no retry ever happens after the first
//! response byte has been flushed to the client — streaming failures after
//! that point only feed cooldowns for future requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::adapters::{kiro_content_length_reply, AdapterContext, DialectAdapter};
use crate::auth::AuthService;
use crate::cache::ChannelCache;
use crate::config::Config;
use crate::cooldown::{Action, AttemptOutcome, CooldownManager};
use crate::error::{ProxyError, STATUS_CLIENT_CLOSED, STATUS_STREAM_INCOMPLETE};
use crate::forward::{
    AttemptFailure, AttemptReply, FinishCallback, ForwardEngine, HttpClients, StreamEnd,
};
use crate::keypick::{select_credential, KeyPick, RoundRobinCursors};
use crate::logs::LogSender;
use crate::selector;
use crate::settings::SettingsHandle;
use crate::store::{AuthTokenRecord, Channel, ChannelType, Credential, LogEntry, Store};

/// Shared application state injected into every request handler.
pub struct ProxyState {
    pub config: Config,
    pub settings: SettingsHandle,
    pub store: Arc<Store>,
    pub cache: Arc<ChannelCache>,
    pub auth: Arc<AuthService>,
    pub cooldowns: Arc<CooldownManager>,
    pub refresher: crate::adapters::oauth::OauthRefresher,
    pub engine: ForwardEngine,
    pub logs: LogSender,
    pub cursors: RoundRobinCursors,
    /// Caps concurrent in-flight proxy requests (`CCLOAD_MAX_CONCURRENCY`).
    pub gate: Arc<Semaphore>,
    pub started_at: Instant,
}

impl ProxyState {
    pub fn build(
        config: Config,
        store: Arc<Store>,
        logs: LogSender,
        max_concurrency: usize,
    ) -> anyhow::Result<Self> {
        let cache = Arc::new(ChannelCache::new(
            store.clone(),
            std::time::Duration::from_secs(config.server.cache_ttl_secs),
        ));
        let settings = SettingsHandle::new(crate::settings::RuntimeSettings::from_map(
            &store.settings_map()?,
        ));
        let auth = Arc::new(AuthService::new(store.load_auth_tokens()?));
        let cooldowns = Arc::new(CooldownManager::new(
            store.clone(),
            cache.clone(),
            settings.clone(),
        ));
        let clients = HttpClients::build(&config.upstream)?;
        let refresher = crate::adapters::oauth::OauthRefresher::new(
            clients.buffered.clone(),
            store.clone(),
            cache.clone(),
        );
        let engine = ForwardEngine::new(clients, config.upstream.clone());

        Ok(Self {
            config,
            settings,
            store,
            cache,
            auth,
            cooldowns,
            refresher,
            engine,
            logs,
            cursors: RoundRobinCursors::new(),
            gate: Arc::new(Semaphore::new(max_concurrency)),
            started_at: Instant::now(),
        })
    }
}

/// Everything the driver needs about one client request.
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Value,
    pub model: String,
    pub channel_type: Option<ChannelType>,
    pub streaming: bool,
    pub token: AuthTokenRecord,
    pub client_ip: Option<String>,
}

impl ProxyRequest {
    fn base_entry(&self) -> LogEntry {
        let mut entry = LogEntry::new(&self.model);
        entry.token_id = Some(self.token.id);
        entry.streaming = self.streaming;
        entry.client_ip = self.client_ip.clone();
        entry
    }
}

/// Route one request through candidates until success or exhaustion.
pub async fn dispatch(state: Arc<ProxyState>, req: ProxyRequest) -> Response {
    let started = Instant::now();
    let settings = state.settings.snapshot();

    let candidates = match selector::candidates(
        &state.cache,
        &settings,
        &req.model,
        req.channel_type,
        &req.token.acl,
        Utc::now(),
    ) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "candidate selection failed");
            vec![]
        }
    };

    if candidates.is_empty() {
        let error = ProxyError::NoCandidateChannel { model: req.model.clone() };
        let mut entry = req.base_entry();
        entry.status = error.wire_status();
        entry.duration_ms = started.elapsed().as_millis() as i64;
        entry.error = Some(error.to_string());
        state.logs.enqueue(entry);
        return error_response(&error);
    }

    let mut last_failure: Option<AttemptFailure> = None;

    'channels: for channel in candidates {
        let adapter = DialectAdapter::for_channel(&channel);
        let creds = match state.cache.keys_by_channel(channel.id) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(channel_id = channel.id, error = %e, "credential load failed");
                continue;
            }
        };
        if creds.is_empty() {
            tracing::debug!(channel_id = channel.id, "channel has no credentials — skipping");
            continue;
        }
        let key_cooldowns = match state.cache.all_key_cooldowns() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "cooldown snapshot failed");
                continue;
            }
        };

        let max_attempts = state.config.upstream.max_key_retries.min(creds.len());
        let mut tried: HashSet<usize> = HashSet::new();

        for _attempt in 0..max_attempts {
            let pick = select_credential(
                &channel,
                &creds,
                &tried,
                &key_cooldowns,
                &state.cursors,
                Utc::now(),
            );
            let credential = match pick {
                KeyPick::Selected(c) => c,
                KeyPick::AllUnavailable => {
                    tracing::debug!(
                        channel_id = channel.id,
                        "all credentials unavailable — next channel"
                    );
                    continue 'channels;
                }
            };
            tried.insert(credential.index);

            match try_one(&state, &req, &channel, adapter, credential, started).await {
                AttemptVerdict::Respond(response) => return response,
                AttemptVerdict::NextKey(failure) => {
                    last_failure = Some(failure);
                }
                AttemptVerdict::NextChannel(failure) => {
                    last_failure = Some(failure);
                    continue 'channels;
                }
            }
        }
    }

    // Exhausted: 502 carrying the last upstream payload so vendor
    // diagnostics survive.
    let body = match &last_failure {
        Some(failure) if !failure.outcome.body.is_empty() => failure.outcome.body.clone(),
        Some(failure) => serde_json::json!({ "error": failure.error.to_string() }).to_string(),
        None => serde_json::json!({ "error": "all upstream channels exhausted" }).to_string(),
    };
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response")
}

enum AttemptVerdict {
    /// Bytes are on their way to the client; the request is over.
    Respond(Response),
    NextKey(AttemptFailure),
    NextChannel(AttemptFailure),
}

async fn try_one(
    state: &Arc<ProxyState>,
    req: &ProxyRequest,
    channel: &Channel,
    adapter: DialectAdapter,
    credential: Credential,
    started: Instant,
) -> AttemptVerdict {
    // OAuth refresh happens before dispatch; an unrefreshable expired token
    // skips this credential.
    let credential = match state
        .refresher
        .refresh_if_needed(adapter, &credential, Utc::now())
        .await
    {
        Ok(c) => c,
        Err(error) => {
            let outcome = AttemptOutcome::new(error.wire_status(), error.to_string());
            let action = state.cooldowns.handle(channel.id, credential.index, &outcome);
            log_attempt_error(state, req, channel, started, &error);
            let failure = AttemptFailure { error, outcome };
            return match action {
                Action::RetryChannel | Action::Fatal => AttemptVerdict::NextChannel(failure),
                _ => AttemptVerdict::NextKey(failure),
            };
        }
    };

    // Kiro's device fingerprint is generated lazily and persisted on first
    // use.
    let credential = ensure_fingerprint(state, adapter, credential);

    let model_actual = channel.resolve_model(&req.model).to_string();
    let ctx = AdapterContext {
        channel,
        credential: &credential,
        model: &model_actual,
        path: &req.path,
        query: req.query.as_deref(),
        streaming: req.streaming,
    };

    let prepared = match adapter.prepare(&ctx, &req.body) {
        Ok(p) => p,
        Err(error @ ProxyError::ClientBadRequest(_)) => {
            let mut entry = req.base_entry();
            entry.channel_id = Some(channel.id);
            entry.model_actual = model_actual;
            entry.status = error.wire_status();
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.error = Some(error.to_string());
            state.logs.enqueue(entry);
            return AttemptVerdict::Respond(error_response(&error));
        }
        Err(error) => {
            let outcome = AttemptOutcome::new(error.wire_status(), error.to_string());
            let action = state.cooldowns.handle(channel.id, credential.index, &outcome);
            log_attempt_error(state, req, channel, started, &error);
            let failure = AttemptFailure { error, outcome };
            return match action {
                Action::RetryChannel | Action::Fatal => AttemptVerdict::NextChannel(failure),
                _ => AttemptVerdict::NextKey(failure),
            };
        }
    };

    // `prepare` built the transformed upstream payload into its own buffer;
    // `req.body` is still the client's original request. The Kiro variant of
    // `response_kind` depends on that: its input-token estimate walks the
    // Anthropic Messages shape, not the conversation-state rewrite.
    let kind = adapter.response_kind(&ctx, &req.body);
    let finish = stream_finish_callback(
        state.clone(),
        req,
        channel.id,
        credential.index,
        model_actual.clone(),
        started,
    );

    let result = state
        .engine
        .attempt(
            req.method.clone(),
            prepared,
            &req.headers,
            req.streaming,
            &kind,
            &model_actual,
            finish,
        )
        .await;

    match result {
        Ok(AttemptReply::Buffered { status, headers, body, summary, first_byte_ms }) => {
            state.cooldowns.reset_channel(channel.id);
            state.cooldowns.reset_key(channel.id, credential.index);

            let settings = state.settings.snapshot();
            let mut entry = req.base_entry();
            entry.channel_id = Some(channel.id);
            entry.model_actual = model_actual.clone();
            entry.status = status.as_u16();
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.first_byte_ms = Some(first_byte_ms);
            entry.input_tokens = summary.counters.input_tokens;
            entry.output_tokens = summary.counters.output_tokens;
            entry.cache_read_tokens = summary.counters.cache_read_tokens;
            entry.cache_creation_tokens = summary.counters.cache_creation_tokens;
            entry.cost_usd = settings.cost_for(
                &model_actual,
                summary.counters.input_tokens,
                summary.counters.output_tokens,
                summary.counters.cache_read_tokens,
                summary.counters.cache_creation_tokens,
            );
            state.logs.enqueue(entry);

            AttemptVerdict::Respond(build_response(status, headers, Body::from(body)))
        }
        Ok(AttemptReply::Streaming { status, headers, body_rx, first_byte_ms }) => {
            // Success/failure is decided at end-of-stream by the finish
            // callback; first bytes are about to flush, so no retry either
            // way.
            let _ = first_byte_ms;
            let stream = futures_util::stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|bytes| (Ok::<_, std::io::Error>(bytes), rx))
            });
            AttemptVerdict::Respond(build_response(status, headers, Body::from_stream(stream)))
        }
        Err(failure) => {
            // Kiro's oversized-conversation 400 is answered as a synthetic
            // max_tokens success; no cooldown, log as 200.
            if adapter == DialectAdapter::Kiro
                && failure.outcome.body.contains(crate::adapters::KIRO_CONTENT_LENGTH_MARKER)
            {
                return AttemptVerdict::Respond(kiro_content_length_response(
                    state,
                    req,
                    channel.id,
                    &model_actual,
                    started,
                ));
            }

            let action = state.cooldowns.handle(channel.id, credential.index, &failure.outcome);
            log_attempt_error(state, req, channel, started, &failure.error);

            match action {
                Action::ReturnClient => AttemptVerdict::Respond(error_response(&failure.error)),
                Action::RetrySameChannelNoCooldown | Action::RetryKey => {
                    AttemptVerdict::NextKey(failure)
                }
                Action::RetryChannel | Action::Fatal => AttemptVerdict::NextChannel(failure),
            }
        }
    }
}

/// Callback run by the streaming pump at end-of-stream: success resets
/// cooldowns, stream-incomplete and embedded errors cool the channel down
/// (future requests only), cancellation is absorbed.
fn stream_finish_callback(
    state: Arc<ProxyState>,
    req: &ProxyRequest,
    channel_id: i64,
    key_index: usize,
    model_actual: String,
    started: Instant,
) -> FinishCallback {
    let mut entry = req.base_entry();
    entry.channel_id = Some(channel_id);
    entry.model_actual = model_actual.clone();

    Box::new(move |end: StreamEnd| {
        let StreamEnd { summary, canceled, bytes_sent } = end;
        let settings = state.settings.snapshot();

        entry.duration_ms = started.elapsed().as_millis() as i64;
        entry.input_tokens = summary.counters.input_tokens;
        entry.output_tokens = summary.counters.output_tokens;
        entry.cache_read_tokens = summary.counters.cache_read_tokens;
        entry.cache_creation_tokens = summary.counters.cache_creation_tokens;
        entry.cost_usd = settings.cost_for(
            &model_actual,
            summary.counters.input_tokens,
            summary.counters.output_tokens,
            summary.counters.cache_read_tokens,
            summary.counters.cache_creation_tokens,
        );

        if canceled {
            entry.status = STATUS_CLIENT_CLOSED;
            entry.error = Some("client canceled".into());
            state.logs.enqueue(entry);
            return;
        }

        if let Some(message) = summary.embedded_error {
            entry.status = 200;
            entry.error = Some(format!("sse error event: {message}"));
            state.logs.enqueue(entry);
            let outcome = AttemptOutcome::new(STATUS_STREAM_INCOMPLETE, message);
            state.cooldowns.handle(channel_id, key_index, &outcome);
            return;
        }

        if !summary.stream_complete {
            entry.status = STATUS_STREAM_INCOMPLETE;
            entry.error = Some(format!("stream ended without sentinel after {bytes_sent} bytes"));
            state.logs.enqueue(entry);
            let outcome = AttemptOutcome::new(STATUS_STREAM_INCOMPLETE, "");
            state.cooldowns.handle(channel_id, key_index, &outcome);
            return;
        }

        entry.status = 200;
        state.logs.enqueue(entry);
        state.cooldowns.reset_channel(channel_id);
        state.cooldowns.reset_key(channel_id, key_index);
    })
}

fn ensure_fingerprint(
    state: &ProxyState,
    adapter: DialectAdapter,
    mut credential: Credential,
) -> Credential {
    if adapter == DialectAdapter::Kiro && credential.device_fingerprint.is_none() {
        let fingerprint = crate::adapters::kiro_generate_fingerprint();
        if let Err(e) = state.store.set_device_fingerprint(
            credential.channel_id,
            credential.index,
            &fingerprint,
        ) {
            tracing::warn!(
                channel_id = credential.channel_id,
                error = %e,
                "device fingerprint persist failed"
            );
        }
        state.cache.invalidate_keys(credential.channel_id);
        credential.device_fingerprint = Some(fingerprint);
    }
    credential
}

fn kiro_content_length_response(
    state: &Arc<ProxyState>,
    req: &ProxyRequest,
    channel_id: i64,
    model_actual: &str,
    started: Instant,
) -> Response {
    let input_tokens = crate::tokenizer::count_request_tokens(&req.body);
    let body = kiro_content_length_reply(model_actual, input_tokens);

    let mut entry = req.base_entry();
    entry.channel_id = Some(channel_id);
    entry.model_actual = model_actual.to_string();
    entry.status = 200;
    entry.duration_ms = started.elapsed().as_millis() as i64;
    entry.input_tokens = input_tokens;
    state.logs.enqueue(entry);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .expect("static response")
}

fn log_attempt_error(
    state: &ProxyState,
    req: &ProxyRequest,
    channel: &Channel,
    started: Instant,
    error: &ProxyError,
) {
    let mut entry = req.base_entry();
    entry.channel_id = Some(channel.id);
    entry.model_actual = channel.resolve_model(&req.model).to_string();
    entry.status = error.wire_status();
    entry.duration_ms = started.elapsed().as_millis() as i64;
    entry.error = Some(error.to_string());
    state.logs.enqueue(entry);
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::builder().status(status);
    if let Some(h) = response.headers_mut() {
        *h = headers;
    }
    response.body(body).expect("response build")
}

fn error_response(error: &ProxyError) -> Response {
    let (status, body) = match error {
        ProxyError::UpstreamHttpError { body, .. } if !body.is_empty() => {
            (error.client_status(), body.clone())
        }
        _ => (
            error.client_status(),
            serde_json::json!({ "error": error.to_string() }).to_string(),
        ),
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response")
}
