//! Dialect adapters — per-vendor protocol translation.
//!
//! [`DialectAdapter`] is an enum selected once per attempt from the channel's
//! `(channel_type, preset)` pair. The set is fixed and closed; routing code
//! interacts with the same small API (`prepare`, `response_kind`, token
//! refresh via [`oauth`]) and every vendor-specific concern
//! — request transforms, auth header injection, path rewrites, response
//! translation — is encapsulated in the adapter modules.

mod anthropic;
mod codex;
mod gemini;
mod kiro;
pub mod oauth;

pub use codex::CodexSseTranslator;
pub use gemini::{model_from_path as gemini_model_from_path, GeminiCliUnwrapper};
pub use kiro::{
    generate_fingerprint as kiro_generate_fingerprint,
    synthetic_max_tokens_sse as kiro_content_length_reply, KiroEventStreamTranslator,
    CONTENT_LENGTH_MARKER as KIRO_CONTENT_LENGTH_MARKER,
};

use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::ProxyError;
use crate::store::{Channel, ChannelPreset, ChannelType, Credential};

/// Inputs shared by every adapter call for one attempt.
pub struct AdapterContext<'a> {
    pub channel: &'a Channel,
    pub credential: &'a Credential,
    /// Model after the channel's redirects were applied.
    pub model: &'a str,
    /// Original client request path, e.g. `/v1/messages`.
    pub path: &'a str,
    /// Raw query string, without the leading `?`.
    pub query: Option<&'a str>,
    pub streaming: bool,
}

/// A fully-prepared upstream request: URL, transformed body, injected headers.
pub struct PreparedRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

/// How the upstream response must be handled before reaching the client.
pub enum ResponseKind {
    /// Bytes proxied verbatim.
    Passthrough,
    /// Codex Responses SSE translated back to chat-completions SSE.
    CodexToChat,
    /// Gemini CLI envelope stripped from each event.
    GeminiCliUnwrap,
    /// AWS EventStream binary decoded into Anthropic SSE. Input tokens are
    /// estimated locally because the upstream does not report them.
    KiroEventStream { estimated_input_tokens: i64 },
}

/// The closed adapter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectAdapter {
    AnthropicPassthrough,
    Codex,
    GeminiStandard,
    GeminiCli,
    Kiro,
}

impl DialectAdapter {
    /// Registry keyed by `(channel_type, preset)`.
    pub fn select(channel_type: ChannelType, preset: Option<ChannelPreset>) -> Self {
        match (channel_type, preset) {
            (ChannelType::Anthropic, Some(ChannelPreset::Kiro)) => Self::Kiro,
            (ChannelType::Anthropic, _) => Self::AnthropicPassthrough,
            (ChannelType::Codex, _) => Self::Codex,
            (ChannelType::Gemini, Some(ChannelPreset::Antigravity)) => Self::GeminiCli,
            (ChannelType::Gemini, _) => Self::GeminiStandard,
        }
    }

    pub fn for_channel(channel: &Channel) -> Self {
        Self::select(channel.channel_type, channel.preset)
    }

    /// Build the upstream request for one attempt.
    pub fn prepare(
        &self,
        ctx: &AdapterContext<'_>,
        body: &Value,
    ) -> Result<PreparedRequest, ProxyError> {
        match self {
            Self::AnthropicPassthrough => anthropic::prepare(ctx, body),
            Self::Codex => codex::prepare(ctx, body),
            Self::GeminiStandard => gemini::prepare_standard(ctx, body),
            Self::GeminiCli => gemini::prepare_cli(ctx, body),
            Self::Kiro => kiro::prepare(ctx, body),
        }
    }

    /// How the response body must be post-processed.
    pub fn response_kind(&self, _ctx: &AdapterContext<'_>, body: &Value) -> ResponseKind {
        match self {
            Self::AnthropicPassthrough | Self::GeminiStandard => ResponseKind::Passthrough,
            Self::Codex => {
                if codex::is_chat_completions_shape(body) {
                    ResponseKind::CodexToChat
                } else {
                    ResponseKind::Passthrough
                }
            }
            Self::GeminiCli => ResponseKind::GeminiCliUnwrap,
            Self::Kiro => ResponseKind::KiroEventStream {
                estimated_input_tokens: kiro::estimate_input_tokens(body),
            },
        }
    }

    /// Whether this adapter's credentials use the OAuth refresh path.
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Self::Codex | Self::GeminiStandard | Self::GeminiCli | Self::Kiro)
    }
}

/// Bearer secret for adapters that accept either a plain key or an OAuth
/// access token.
pub(crate) fn bearer_secret(credential: &Credential) -> Result<String, ProxyError> {
    if let Some(oauth) = &credential.oauth {
        return Ok(oauth.access_token.clone());
    }
    credential
        .api_key
        .clone()
        .ok_or_else(|| ProxyError::UpstreamTransport("credential has no secret material".into()))
}
