//! TTL read-through cache in front of the store.
//!
//! The hot path reads channel metadata, credentials and cooldown snapshots on
//! every request; the store is SQLite. This cache keeps those reads off the
//! database for `ttl` (60 s by default) and exposes the invalidation entry
//! points that mutation paths call.
//!
//! Failure policy: a store error is returned to the caller and nothing is
//! cached — the cache degrades to a pass-through and never serves stale data
//! past its TTL, never blocks longer than the store itself.
//!
//! Note: the by-model key does not encode the match relaxation flags; a
//! settings flip is picked up within one TTL, which is the cache's general
//! staleness contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::matching::{self, MatchOpts};
use crate::store::{Channel, ChannelType, CooldownRecord, Credential, Store};

struct Cached<T> {
    at: Instant,
    value: T,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.at.elapsed() < ttl).then(|| self.value.clone())
    }
}

/// Keys for cooldown snapshot slots.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum CooldownKind {
    Channel,
    Key,
}

pub struct ChannelCache {
    store: Arc<Store>,
    ttl: Duration,
    by_id: DashMap<i64, Cached<Arc<Channel>>>,
    by_model: DashMap<String, Cached<Arc<Vec<Channel>>>>,
    by_type: DashMap<ChannelType, Cached<Arc<Vec<Channel>>>>,
    keys: DashMap<i64, Cached<Arc<Vec<Credential>>>>,
    channel_cooldowns: DashMap<CooldownKind, Cached<Arc<HashMap<i64, CooldownRecord>>>>,
    key_cooldowns: DashMap<CooldownKind, Cached<Arc<HashMap<(i64, usize), CooldownRecord>>>>,
}

impl ChannelCache {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            by_id: DashMap::new(),
            by_model: DashMap::new(),
            by_type: DashMap::new(),
            keys: DashMap::new(),
            channel_cooldowns: DashMap::new(),
            key_cooldowns: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn channel_by_id(&self, id: i64) -> anyhow::Result<Option<Arc<Channel>>> {
        if let Some(entry) = self.by_id.get(&id) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(Some(hit));
            }
        }
        match self.store.channel_by_id(id)? {
            Some(ch) => {
                let arc = Arc::new(ch);
                self.by_id.insert(id, Cached { at: Instant::now(), value: arc.clone() });
                Ok(Some(arc))
            }
            None => Ok(None),
        }
    }

    /// Enabled channels supporting `model` under the current match options,
    /// in the store's canonical (priority, id) order.
    pub fn enabled_channels_by_model(
        &self,
        model: &str,
        opts: MatchOpts,
    ) -> anyhow::Result<Arc<Vec<Channel>>> {
        if let Some(entry) = self.by_model.get(model) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(hit);
            }
        }
        let channels: Vec<Channel> = self
            .store
            .enabled_channels()?
            .into_iter()
            .filter(|ch| matching::channel_supports(ch, model, opts).is_some())
            .collect();
        let arc = Arc::new(channels);
        self.by_model
            .insert(model.to_string(), Cached { at: Instant::now(), value: arc.clone() });
        Ok(arc)
    }

    /// Enabled channels of one dialect, canonical order.
    pub fn enabled_channels_by_type(
        &self,
        channel_type: ChannelType,
    ) -> anyhow::Result<Arc<Vec<Channel>>> {
        if let Some(entry) = self.by_type.get(&channel_type) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(hit);
            }
        }
        let channels: Vec<Channel> = self
            .store
            .enabled_channels()?
            .into_iter()
            .filter(|ch| ch.channel_type == channel_type)
            .collect();
        let arc = Arc::new(channels);
        self.by_type
            .insert(channel_type, Cached { at: Instant::now(), value: arc.clone() });
        Ok(arc)
    }

    pub fn keys_by_channel(&self, channel_id: i64) -> anyhow::Result<Arc<Vec<Credential>>> {
        if let Some(entry) = self.keys.get(&channel_id) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(hit);
            }
        }
        let arc = Arc::new(self.store.keys_for_channel(channel_id)?);
        self.keys
            .insert(channel_id, Cached { at: Instant::now(), value: arc.clone() });
        Ok(arc)
    }

    pub fn all_channel_cooldowns(&self) -> anyhow::Result<Arc<HashMap<i64, CooldownRecord>>> {
        if let Some(entry) = self.channel_cooldowns.get(&CooldownKind::Channel) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(hit);
            }
        }
        let arc = Arc::new(self.store.all_channel_cooldowns()?);
        self.channel_cooldowns
            .insert(CooldownKind::Channel, Cached { at: Instant::now(), value: arc.clone() });
        Ok(arc)
    }

    pub fn all_key_cooldowns(&self) -> anyhow::Result<Arc<HashMap<(i64, usize), CooldownRecord>>> {
        if let Some(entry) = self.key_cooldowns.get(&CooldownKind::Key) {
            if let Some(hit) = entry.fresh(self.ttl) {
                return Ok(hit);
            }
        }
        let arc = Arc::new(self.store.all_key_cooldowns()?);
        self.key_cooldowns
            .insert(CooldownKind::Key, Cached { at: Instant::now(), value: arc.clone() });
        Ok(arc)
    }

    // -- invalidation entry points ------------------------------------------

    /// Channel metadata changed: wipe everything derived from the channel set.
    pub fn invalidate_channels(&self) {
        self.by_id.clear();
        self.by_model.clear();
        self.by_type.clear();
    }

    /// One channel changed. The model/type lists embed channel copies, so
    /// they are wiped wholesale.
    pub fn invalidate_channel(&self, id: i64) {
        self.by_id.remove(&id);
        self.by_model.clear();
        self.by_type.clear();
    }

    pub fn invalidate_keys(&self, channel_id: i64) {
        self.keys.remove(&channel_id);
    }

    /// Called after every cooldown write or reset.
    pub fn invalidate_cooldowns(&self) {
        self.channel_cooldowns.clear();
        self.key_cooldowns.clear();
    }
}
