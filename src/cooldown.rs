//! Failure classification and cooldown persistence.
//!
//! Every failed attempt funnels through [`CooldownManager::handle`], which
//! classifies the outcome into an [`Action`] and persists the side effects
//! (credential or channel cooldown rows, escalation, cache invalidation).
//! Successful attempts call the `reset_*` entry points, which clear the
//! entity's record so the exponential policy restarts from its base.
//!
//! Durations come from the runtime settings: `fixed` writes the same interval
//! every time; `exponential` doubles the previous cooldown of the same
//! entity, derived from the persisted record's `until_ts - set_ts` — there is
//! no separate attempt-counter table.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::cache::ChannelCache;
use crate::error::{
    STATUS_EMPTY_OK, STATUS_FIRST_BYTE_TIMEOUT, STATUS_NETWORK_ERROR, STATUS_STREAM_INCOMPLETE,
    STATUS_TOTAL_TIMEOUT,
};
use crate::settings::{CooldownMode, SettingsHandle};
use crate::store::{CooldownRecord, Store};

/// Upstream error-body signature that forces a 24-hour cooldown regardless of
/// the configured mode (Kiro account suspension).
const SUSPENDED_SIGNATURES: [&str; 2] = ["TEMPORARILY_SUSPENDED", "temporarily suspended"];

/// How many bytes of the error body the classifier looks at.
pub const CLASSIFY_BODY_CAP: usize = 4096;

/// What the retry driver should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Ignore verdicts (client closed mid-stream); no cooldown written.
    RetrySameChannelNoCooldown,
    /// Credential-scoped failure; try the next credential of the same channel.
    RetryKey,
    /// Channel-scoped failure; move to the next candidate channel.
    RetryChannel,
    /// Deterministically the client's fault; surface the body unchanged.
    ReturnClient,
    /// Unreachable-by-design classification hole; logged and treated as
    /// [`Action::RetryChannel`].
    Fatal,
}

/// Everything the classifier looks at for one failed attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Real HTTP status, or a synthetic 59x/499 code.
    pub status: u16,
    /// First [`CLASSIFY_BODY_CAP`] bytes of the error body.
    pub body: String,
    /// Connection-level failure flag (no HTTP exchange completed).
    pub network_error: bool,
    /// Response headers; only consulted for 429 disambiguation.
    pub headers: axum::http::HeaderMap,
}

impl AttemptOutcome {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        let mut body: String = body.into();
        body.truncate(CLASSIFY_BODY_CAP);
        Self { status, body, network_error: false, headers: Default::default() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        let mut outcome = Self::new(STATUS_NETWORK_ERROR, message);
        outcome.network_error = true;
        outcome
    }

    fn is_suspended(&self) -> bool {
        SUSPENDED_SIGNATURES.iter().any(|sig| self.body.contains(sig))
    }
}

/// Pure classification — no persistence. Exposed for tests and the driver.
pub fn classify(outcome: &AttemptOutcome) -> Action {
    if outcome.is_suspended() {
        return Action::RetryChannel;
    }
    if outcome.network_error {
        return Action::RetryChannel;
    }

    match outcome.status {
        // Client went away; nothing upstream did wrong.
        crate::error::STATUS_CLIENT_CLOSED => Action::RetrySameChannelNoCooldown,

        // Credential-scoped: rejected or unauthorized key.
        401 | 403 => Action::RetryKey,

        // Quota exhausted for this credential.
        402 => Action::RetryKey,

        429 => {
            if rate_limit_is_account_wide(&outcome.body, &outcome.headers) {
                Action::RetryChannel
            } else {
                Action::RetryKey
            }
        }

        // Deterministically the client's fault.
        400 | 404 | 405 | 413 | 422 => Action::ReturnClient,

        // Upstream-side request timeout.
        408 | 524 => Action::RetryChannel,

        STATUS_NETWORK_ERROR | STATUS_FIRST_BYTE_TIMEOUT | STATUS_TOTAL_TIMEOUT
        | STATUS_STREAM_INCOMPLETE | STATUS_EMPTY_OK => Action::RetryChannel,

        s if s >= 500 => Action::RetryChannel,

        // Remaining 4xx: treat like client errors.
        s if (400..500).contains(&s) => Action::ReturnClient,

        // 1xx/3xx/sub-100: should not reach the classifier.
        _ => Action::Fatal,
    }
}

/// Account-wide 429 versus per-credential 429. An explicit scope header wins;
/// otherwise fall back to body wording. `insufficient_quota` stays
/// credential-scoped by design.
fn rate_limit_is_account_wide(body: &str, headers: &axum::http::HeaderMap) -> bool {
    if let Some(scope) = headers.get("x-ratelimit-scope").and_then(|v| v.to_str().ok()) {
        return scope.eq_ignore_ascii_case("account");
    }
    if body.contains("insufficient_quota") {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("account") || lower.contains("organization")
}

pub struct CooldownManager {
    store: Arc<Store>,
    cache: Arc<ChannelCache>,
    settings: SettingsHandle,
}

impl CooldownManager {
    pub fn new(store: Arc<Store>, cache: Arc<ChannelCache>, settings: SettingsHandle) -> Self {
        Self { store, cache, settings }
    }

    /// Classify `outcome` and persist the side effects for
    /// `(channel_id, key_index)`. Returns the action for the retry driver.
    pub fn handle(&self, channel_id: i64, key_index: usize, outcome: &AttemptOutcome) -> Action {
        let action = classify(outcome);
        let now = Utc::now();

        match action {
            Action::RetrySameChannelNoCooldown | Action::ReturnClient => {}
            Action::RetryKey => {
                if let Err(e) = self.apply_key_cooldown(channel_id, key_index, outcome, now) {
                    tracing::warn!(channel_id, key_index, error = %e, "key cooldown write failed");
                }
            }
            Action::RetryChannel => {
                if let Err(e) = self.apply_channel_cooldown(channel_id, outcome, now) {
                    tracing::warn!(channel_id, error = %e, "channel cooldown write failed");
                }
            }
            Action::Fatal => {
                tracing::warn!(
                    channel_id,
                    status = outcome.status,
                    "unclassifiable upstream outcome — treating as channel failure"
                );
                if let Err(e) = self.apply_channel_cooldown(channel_id, outcome, now) {
                    tracing::warn!(channel_id, error = %e, "channel cooldown write failed");
                }
            }
        }
        action
    }

    fn apply_key_cooldown(
        &self,
        channel_id: i64,
        key_index: usize,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let prev = self.store.key_cooldown(channel_id, key_index)?;
        let duration = self.next_duration(prev, outcome, now);
        self.store.set_key_cooldown(
            channel_id,
            key_index,
            CooldownRecord { until: now + duration, set_at: now, last_status: outcome.status },
        )?;
        tracing::info!(
            channel_id,
            key_index,
            status = outcome.status,
            secs = duration.num_seconds(),
            "credential cooldown set"
        );

        // When all but one credentials were already cooling, this write makes
        // it all of them — escalate to a channel-level cooldown so selection
        // stops considering the channel at all.
        let channel = self.store.channel_by_id(channel_id)?;
        if let Some(channel) = channel {
            if channel.key_count > 0 {
                let cooling = self
                    .store
                    .all_key_cooldowns()?
                    .iter()
                    .filter(|((cid, _), rec)| *cid == channel_id && rec.is_active(now))
                    .count();
                if cooling >= channel.key_count {
                    self.apply_channel_cooldown(channel_id, outcome, now)?;
                }
            }
        }

        self.cache.invalidate_cooldowns();
        Ok(())
    }

    fn apply_channel_cooldown(
        &self,
        channel_id: i64,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let prev = self.store.channel_cooldown(channel_id)?;
        let duration = self.next_duration(prev, outcome, now);
        self.store.set_channel_cooldown(
            channel_id,
            CooldownRecord { until: now + duration, set_at: now, last_status: outcome.status },
        )?;
        tracing::info!(
            channel_id,
            status = outcome.status,
            secs = duration.num_seconds(),
            "channel cooldown set"
        );
        self.cache.invalidate_cooldowns();
        Ok(())
    }

    /// Next cooldown duration for an entity whose previous record is `prev`.
    fn next_duration(
        &self,
        prev: Option<CooldownRecord>,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Duration {
        if outcome.is_suspended() {
            return Duration::hours(24);
        }
        let settings = self.settings.snapshot();
        match settings.cooldown_mode {
            CooldownMode::Fixed => Duration::seconds(settings.cooldown_fixed_secs.max(1)),
            CooldownMode::Exponential => {
                let base = settings.cooldown_base_secs.max(1);
                let cap = settings.cooldown_cap_secs.max(base);
                let next = match prev {
                    // A record lapsed for longer than its own duration no
                    // longer chains; the next failure reseeds from base.
                    Some(rec) if rec.until + (rec.until - rec.set_at) > now => {
                        let prev_secs = (rec.until - rec.set_at).num_seconds().max(base);
                        prev_secs.saturating_mul(2)
                    }
                    _ => base,
                };
                Duration::seconds(next.clamp(1, cap))
            }
        }
    }

    /// Clear the channel-level record after a successful attempt.
    pub fn reset_channel(&self, channel_id: i64) {
        if let Err(e) = self.store.clear_channel_cooldown(channel_id) {
            tracing::warn!(channel_id, error = %e, "channel cooldown reset failed");
        }
        self.cache.invalidate_cooldowns();
    }

    /// Clear the credential-level record after a successful attempt.
    pub fn reset_key(&self, channel_id: i64, key_index: usize) {
        if let Err(e) = self.store.clear_key_cooldown(channel_id, key_index) {
            tracing::warn!(channel_id, key_index, error = %e, "key cooldown reset failed");
        }
        self.cache.invalidate_cooldowns();
    }
}
