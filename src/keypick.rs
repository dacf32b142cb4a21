//! Credential selection within a chosen channel.
//!
//! Given the channel's cached credential list, the indices already tried in
//! this request, and a cooldown snapshot taken at the start of the attempt,
//! pick the next credential per the channel's key strategy:
//!
//! - `sequential` — lowest usable index;
//! - `round_robin` — first usable index after the last served one, cursor
//!   kept per channel in memory (restart resets it).
//!
//! When nothing qualifies the dedicated [`KeyPick::AllUnavailable`] sentinel
//! is returned so the retry driver can move to the next channel without
//! conflating this with a transport error.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::store::{Channel, CooldownRecord, Credential, KeyStrategy};

/// Outcome of one credential-selection call.
#[derive(Debug, Clone)]
pub enum KeyPick {
    Selected(Credential),
    /// Every credential is either already tried or cooling down.
    AllUnavailable,
}

/// Per-channel round-robin cursors. Shared process-wide; in-memory only.
#[derive(Default)]
pub struct RoundRobinCursors {
    last_served: DashMap<i64, usize>,
}

impl RoundRobinCursors {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_index(&self, channel_id: i64, len: usize) -> usize {
        self.last_served
            .get(&channel_id)
            .map(|v| (*v + 1) % len)
            .unwrap_or(0)
    }

    fn record(&self, channel_id: i64, index: usize) {
        self.last_served.insert(channel_id, index);
    }
}

/// Pick one credential, or the sentinel when all are unavailable.
pub fn select_credential(
    channel: &Channel,
    creds: &[Credential],
    tried: &HashSet<usize>,
    key_cooldowns: &HashMap<(i64, usize), CooldownRecord>,
    cursors: &RoundRobinCursors,
    now: DateTime<Utc>,
) -> KeyPick {
    if creds.is_empty() {
        return KeyPick::AllUnavailable;
    }

    let n = creds.len();
    let order: Vec<usize> = match channel.key_strategy {
        KeyStrategy::Sequential => (0..n).collect(),
        KeyStrategy::RoundRobin => {
            let start = cursors.start_index(channel.id, n);
            (0..n).map(|i| (start + i) % n).collect()
        }
    };

    for pos in order {
        let cred = &creds[pos];
        if tried.contains(&cred.index) {
            continue;
        }
        if key_cooldowns
            .get(&(channel.id, cred.index))
            .is_some_and(|rec| rec.is_active(now))
        {
            continue;
        }
        if channel.key_strategy == KeyStrategy::RoundRobin {
            cursors.record(channel.id, pos);
        }
        return KeyPick::Selected(cred.clone());
    }

    KeyPick::AllUnavailable
}
