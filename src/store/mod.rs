//! Durable state: channels, credentials, cooldowns, auth tokens, logs.
//!
//! The concrete backend is SQLite ([`sqlite::Store`]); everything above it
//! (cache, selector, cooldown manager, log pipeline) talks to the [`Store`]
//! facade and knows nothing about the schema. Reads are expected to be cheap
//! and frequent — the channel cache sits in front of the hottest queries.

mod sqlite;

pub use sqlite::Store;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which API dialect a channel speaks on its client-facing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Anthropic,
    Codex,
    Gemini,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Self::Anthropic),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-specific sub-flavor of a channel type. Selects the dialect adapter
/// together with [`ChannelType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPreset {
    Official,
    Custom,
    Antigravity,
    Kiro,
}

impl ChannelPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::Custom => "custom",
            Self::Antigravity => "antigravity",
            Self::Kiro => "kiro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "official" => Some(Self::Official),
            "custom" => Some(Self::Custom),
            "antigravity" => Some(Self::Antigravity),
            "kiro" => Some(Self::Kiro),
            _ => None,
        }
    }
}

/// How credentials within a channel are ordered when picking one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Prefer the lowest non-cooling index.
    #[default]
    Sequential,
    /// Rotate, starting after the last served index.
    RoundRobin,
}

/// An alternative base URL for a channel, with latency measured by the
/// (out-of-core) endpoint tester. At most one endpoint is active per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub url: String,
    pub latency_ms: Option<i64>,
    pub active: bool,
}

/// A configured upstream identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub preset: Option<ChannelPreset>,
    pub base_url: String,
    /// Lower number = higher preference.
    pub priority: i64,
    pub enabled: bool,
    /// Supported model names. `*` matches everything.
    pub models: Vec<String>,
    /// Model alias → actual model rewrites applied before the adapter runs.
    pub redirects: HashMap<String, String>,
    pub openai_compatible: bool,
    pub key_strategy: KeyStrategy,
    /// Number of credentials configured for this channel.
    pub key_count: usize,
    pub endpoints: Vec<Endpoint>,
}

impl Channel {
    /// The URL requests are sent to: the active endpoint when one exists,
    /// the channel base URL otherwise.
    pub fn effective_url(&self) -> &str {
        self.endpoints
            .iter()
            .find(|e| e.active)
            .map(|e| e.url.as_str())
            .unwrap_or(self.base_url.as_str())
    }

    /// Apply the channel's model redirects. Returns the input when no
    /// redirect matches.
    pub fn resolve_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.redirects.get(model).map(String::as_str).unwrap_or(model)
    }
}

/// OAuth token bundle for credentials that authenticate via refresh flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One authenticator within a channel, indexed 0..N-1 (contiguous).
#[derive(Debug, Clone)]
pub struct Credential {
    pub channel_id: i64,
    pub index: usize,
    /// Plain API key; mutually exclusive with `oauth` in practice, but the
    /// store tolerates both being set (the adapter decides which it needs).
    pub api_key: Option<String>,
    pub oauth: Option<OauthBundle>,
    /// Stable 64-hex identity used by the Kiro adapter; generated lazily.
    pub device_fingerprint: Option<String>,
}

/// A time-bounded suppression of a channel or credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownRecord {
    pub until: DateTime<Utc>,
    /// When this record was written — the exponential policy derives the
    /// previous duration from `until - set_at`.
    pub set_at: DateTime<Utc>,
    pub last_status: u16,
}

impl CooldownRecord {
    /// A record whose `until` is in the past is equivalent to absent.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

/// Per-token channel access control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAcl {
    All,
    Channels(HashSet<i64>),
}

impl ChannelAcl {
    pub fn allows(&self, channel_id: i64) -> bool {
        match self {
            Self::All => true,
            Self::Channels(set) => set.contains(&channel_id),
        }
    }
}

/// Hot-path view of an issued bearer token.
#[derive(Debug, Clone)]
pub struct AuthTokenRecord {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub acl: ChannelAcl,
}

/// Per-request terminal accounting record. Immutable once enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub token_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub model_requested: String,
    /// Model actually sent upstream, after redirects.
    pub model_actual: String,
    /// Real or synthetic wire status.
    pub status: u16,
    pub duration_ms: i64,
    pub streaming: bool,
    pub first_byte_ms: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_usd: f64,
    pub client_ip: Option<String>,
    pub error: Option<String>,
}

impl LogEntry {
    /// Blank entry for a request that never produced usage.
    pub fn new(model_requested: &str) -> Self {
        Self {
            ts: Utc::now(),
            token_id: None,
            channel_id: None,
            model_requested: model_requested.to_string(),
            model_actual: model_requested.to_string(),
            status: 0,
            duration_ms: 0,
            streaming: false,
            first_byte_ms: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_usd: 0.0,
            client_ip: None,
            error: None,
        }
    }
}

/// One row of the `(day, channel, model, token)` aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct DailyStatRow {
    pub day: String,
    pub channel_id: i64,
    pub model: String,
    pub token_id: i64,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

/// Channel fields used on insert, before an id exists.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: ChannelType,
    pub preset: Option<ChannelPreset>,
    pub base_url: String,
    pub priority: i64,
    pub enabled: bool,
    pub models: Vec<String>,
    pub redirects: HashMap<String, String>,
    pub openai_compatible: bool,
    pub key_strategy: KeyStrategy,
}

impl NewChannel {
    /// Minimal constructor used heavily in tests.
    pub fn basic(name: &str, channel_type: ChannelType, base_url: &str, models: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            channel_type,
            preset: None,
            base_url: base_url.to_string(),
            priority: 10,
            enabled: true,
            models: models.iter().map(|m| m.to_string()).collect(),
            redirects: HashMap::new(),
            openai_compatible: false,
            key_strategy: KeyStrategy::Sequential,
        }
    }
}
