//! Error taxonomy for the proxy hot path.
//!
//! [`ProxyError`] is the classified outcome of a forwarding attempt or of the
//! request pipeline around it. The cooldown manager consumes the upstream
//! kinds; the HTTP layer maps every kind to a client-facing status.
//!
//! Attempt outcomes that never reached a real HTTP status (transport errors,
//! timeouts, half-finished streams) are assigned *synthetic* wire statuses in
//! the 59x range so the cooldown classifier and the log pipeline can treat
//! every outcome uniformly as `(status, body)`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Synthetic status: upstream connection / protocol failure before any response.
pub const STATUS_NETWORK_ERROR: u16 = 599;
/// Synthetic status: streaming attempt produced no first byte within the deadline.
pub const STATUS_FIRST_BYTE_TIMEOUT: u16 = 598;
/// Synthetic status: non-streaming attempt exceeded the total deadline.
pub const STATUS_TOTAL_TIMEOUT: u16 = 597;
/// Synthetic status: HTTP 200 stream ended without a completion sentinel.
pub const STATUS_STREAM_INCOMPLETE: u16 = 596;
/// Synthetic status: HTTP 200 with `Content-Length: 0`.
pub const STATUS_EMPTY_OK: u16 = 595;
/// Synthetic status: client went away mid-request (nginx convention).
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Classified proxy failure.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request is deterministically the client's fault; surfaced as-is.
    #[error("bad request: {0}")]
    ClientBadRequest(String),

    /// Missing, unknown, disabled or expired bearer token.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No enabled channel supports the requested model (after ACL filtering).
    #[error("no available channel for model `{model}`")]
    NoCandidateChannel { model: String },

    /// Every credential of a channel is cooling down. Equivalent to skipping
    /// the channel — never surfaced to the client directly.
    #[error("all credentials of channel {channel_id} are cooling down")]
    AllCredentialsCoolingDown { channel_id: i64 },

    /// Connection-level failure talking to the upstream.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// First-byte (streaming) or total (non-streaming) deadline exceeded.
    #[error("upstream timeout (first_byte={first_byte})")]
    UpstreamTimeout { first_byte: bool },

    /// Upstream answered with a non-2xx status. Body is capped at 1 MB.
    #[error("upstream returned HTTP {status}")]
    UpstreamHttpError { status: u16, body: String },

    /// Streaming response ended without a sentinel and without client cancel.
    #[error("upstream stream ended without completion sentinel")]
    StreamIncomplete,

    /// Upstream returned 200 OK with an empty body.
    #[error("upstream returned empty 200 response")]
    EmptyOkResponse,

    /// OAuth refresh failed and the stored token is already expired.
    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// Client disconnected. Absorbed silently: logged, never cooled down.
    #[error("request canceled by client")]
    Canceled,

    /// The process is draining; new work is refused.
    #[error("shutting down")]
    ShuttingDown,
}

impl ProxyError {
    /// The status recorded for this outcome in cooldown records and log rows.
    ///
    /// Real upstream statuses pass through; everything else gets a synthetic
    /// code from the constants above.
    pub fn wire_status(&self) -> u16 {
        match self {
            Self::ClientBadRequest(_) => 400,
            Self::AuthFailed(_) => 401,
            Self::NoCandidateChannel { .. } => 503,
            Self::AllCredentialsCoolingDown { .. } => 503,
            Self::UpstreamTransport(_) => STATUS_NETWORK_ERROR,
            Self::UpstreamTimeout { first_byte: true } => STATUS_FIRST_BYTE_TIMEOUT,
            Self::UpstreamTimeout { first_byte: false } => STATUS_TOTAL_TIMEOUT,
            Self::UpstreamHttpError { status, .. } => *status,
            Self::StreamIncomplete => STATUS_STREAM_INCOMPLETE,
            Self::EmptyOkResponse => STATUS_EMPTY_OK,
            Self::TokenRefreshFailed(_) => 401,
            Self::Canceled => STATUS_CLIENT_CLOSED,
            Self::ShuttingDown => 503,
        }
    }

    /// True when the failure happened on the wire to the upstream rather than
    /// in this process or the client's request.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransport(_) | Self::UpstreamTimeout { .. }
        )
    }

    /// The status the *client* sees when this error terminates the request.
    pub fn client_status(&self) -> StatusCode {
        match self {
            Self::ClientBadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::NoCandidateChannel { .. } | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamHttpError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            // Everything else that bubbles to the client is a gateway failure.
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Failure escaping an infrastructure handler (models listing, token
/// counting). Proxy-path failures carry a [`ProxyError`]; anything else is
/// shaped into the same vendor-style JSON envelope the auth layer and the
/// proxy surface already emit, so clients see one error dialect.
#[derive(Debug)]
pub struct AppError {
    cause: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(target: "ccload::api", cause = %self.cause, "infrastructure endpoint failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": { "type": "internal_error", "message": self.cause.to_string() },
            })),
        )
            .into_response()
    }
}

// Infrastructure handlers return `anyhow::Result` internally; `?` lands
// here. Deliberately not a blanket impl: proxy-path code must classify into
// `ProxyError` instead of falling through to a 500.
impl From<anyhow::Error> for AppError {
    fn from(cause: anyhow::Error) -> Self {
        Self { cause }
    }
}
