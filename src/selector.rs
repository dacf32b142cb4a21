//! Channel selection — turns `(model, channel-type, token ACL)` into an
//! ordered candidate list for the retry driver.
//!
//! Selection is a pure filter pipeline over cached channel metadata:
//!
//! 1. dialect/model pre-filter (cache keys `by_type` / `by_model`),
//! 2. token ACL (fail-closed),
//! 3. drop channels that are *fully cooled* — channel-level cooldown active,
//!    or every credential cooling,
//! 4. optional load-balance shuffle within equal-priority groups, keeping
//!    the inter-group priority order intact.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::cache::ChannelCache;
use crate::matching::MatchOpts;
use crate::settings::RuntimeSettings;
use crate::store::{Channel, ChannelAcl, ChannelType};

/// Produce the ordered candidate list for one request.
///
/// `model` may be empty when the caller routes purely by dialect (e.g.
/// `GET /v1beta/models` aggregation); `channel_type` narrows to one dialect.
pub fn candidates(
    cache: &ChannelCache,
    settings: &RuntimeSettings,
    model: &str,
    channel_type: Option<ChannelType>,
    acl: &ChannelAcl,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Channel>> {
    let opts = MatchOpts {
        strip_date: settings.strip_date_fallback,
        fuzzy: settings.fuzzy_model_match,
    };

    let base: Vec<Channel> = match (channel_type, model.is_empty()) {
        (Some(t), true) => cache.enabled_channels_by_type(t)?.as_ref().clone(),
        (Some(t), false) => cache
            .enabled_channels_by_model(model, opts)?
            .iter()
            .filter(|ch| ch.channel_type == t)
            .cloned()
            .collect(),
        (None, _) => cache.enabled_channels_by_model(model, opts)?.as_ref().clone(),
    };

    let allowed: Vec<Channel> = base.into_iter().filter(|ch| acl.allows(ch.id)).collect();
    if allowed.is_empty() {
        return Ok(vec![]);
    }

    let channel_cooldowns = cache.all_channel_cooldowns()?;
    let key_cooldowns = cache.all_key_cooldowns()?;

    let mut list: Vec<Channel> = allowed
        .into_iter()
        .filter(|ch| {
            if channel_cooldowns.get(&ch.id).is_some_and(|rec| rec.is_active(now)) {
                return false;
            }
            if ch.key_count > 0 {
                let cooling = key_cooldowns
                    .iter()
                    .filter(|((cid, _), rec)| *cid == ch.id && rec.is_active(now))
                    .count();
                if cooling >= ch.key_count {
                    return false;
                }
            }
            true
        })
        .collect();

    if settings.load_balance_enabled {
        shuffle_within_priority_groups(&mut list);
    }

    Ok(list)
}

/// Shuffle each run of equal-priority channels in place. The list arrives in
/// (priority, id) order, so equal priorities are always contiguous.
fn shuffle_within_priority_groups(list: &mut [Channel]) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < list.len() {
        let priority = list[start].priority;
        let mut end = start + 1;
        while end < list.len() && list[end].priority == priority {
            end += 1;
        }
        list[start..end].shuffle(&mut rng);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CooldownRecord, Credential, NewChannel, Store};
    use chrono::Duration;
    use std::sync::Arc;

    fn fixture() -> (ChannelCache, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Zero TTL so store mutations are immediately visible.
        (ChannelCache::new(store.clone(), std::time::Duration::from_secs(0)), store)
    }

    fn seed(store: &Store, name: &str, priority: i64, models: &[&str]) -> i64 {
        let mut ch = NewChannel::basic(name, ChannelType::Anthropic, "https://x", models);
        ch.priority = priority;
        store.insert_channel(&ch).unwrap()
    }

    fn seed_key(store: &Store, channel_id: i64, index: usize) {
        store
            .upsert_credential(&Credential {
                channel_id,
                index,
                api_key: Some(format!("sk-{index}")),
                oauth: None,
                device_fingerprint: None,
            })
            .unwrap();
    }

    fn cooling(until_secs: i64) -> CooldownRecord {
        CooldownRecord {
            until: Utc::now() + Duration::seconds(until_secs),
            set_at: Utc::now(),
            last_status: 529,
        }
    }

    fn select(cache: &ChannelCache, model: &str, acl: &ChannelAcl) -> Vec<String> {
        candidates(cache, &RuntimeSettings::default(), model, None, acl, Utc::now())
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Ordering & model filter
    // -----------------------------------------------------------------------

    #[test]
    fn candidates_ordered_by_priority() {
        let (cache, store) = fixture();
        seed(&store, "secondary", 20, &["claude-sonnet-4-5"]);
        seed(&store, "primary", 10, &["claude-sonnet-4-5"]);
        seed(&store, "other-model", 5, &["gemini-2.5-pro"]);

        let names = select(&cache, "claude-sonnet-4-5", &ChannelAcl::All);
        assert_eq!(names, vec!["primary", "secondary"]);
    }

    #[test]
    fn no_matching_channel_yields_empty_list() {
        let (cache, store) = fixture();
        seed(&store, "c", 10, &["claude-sonnet-4-5"]);
        assert!(select(&cache, "gpt-4o", &ChannelAcl::All).is_empty());
    }

    #[test]
    fn type_filter_without_model_returns_dialect() {
        let (cache, store) = fixture();
        seed(&store, "anthropic", 10, &["m"]);
        store
            .insert_channel(&NewChannel::basic("gem", ChannelType::Gemini, "https://g", &["m"]))
            .unwrap();

        let list = candidates(
            &cache,
            &RuntimeSettings::default(),
            "",
            Some(ChannelType::Gemini),
            &ChannelAcl::All,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "gem");
    }

    // -----------------------------------------------------------------------
    // ACL
    // -----------------------------------------------------------------------

    #[test]
    fn explicit_acl_filters_channels() {
        let (cache, store) = fixture();
        let a = seed(&store, "a", 10, &["m"]);
        let _b = seed(&store, "b", 10, &["m"]);

        let acl = ChannelAcl::Channels([a].into_iter().collect());
        let names = select(&cache, "m", &acl);
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn empty_acl_set_yields_no_candidates() {
        let (cache, store) = fixture();
        seed(&store, "a", 10, &["m"]);
        let acl = ChannelAcl::Channels(Default::default());
        assert!(select(&cache, "m", &acl).is_empty());
    }

    // -----------------------------------------------------------------------
    // Fully-cooled filtering
    // -----------------------------------------------------------------------

    #[test]
    fn channel_level_cooldown_excludes_channel() {
        let (cache, store) = fixture();
        let a = seed(&store, "a", 10, &["m"]);
        seed(&store, "b", 20, &["m"]);
        store.set_channel_cooldown(a, cooling(60)).unwrap();

        let names = select(&cache, "m", &ChannelAcl::All);
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn expired_channel_cooldown_is_ignored() {
        let (cache, store) = fixture();
        let a = seed(&store, "a", 10, &["m"]);
        store.set_channel_cooldown(a, cooling(-5)).unwrap();

        let names = select(&cache, "m", &ChannelAcl::All);
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn channel_with_all_keys_cooling_is_excluded() {
        let (cache, store) = fixture();
        let a = seed(&store, "a", 10, &["m"]);
        seed_key(&store, a, 0);
        seed_key(&store, a, 1);
        store.set_key_cooldown(a, 0, cooling(60)).unwrap();
        store.set_key_cooldown(a, 1, cooling(60)).unwrap();

        assert!(select(&cache, "m", &ChannelAcl::All).is_empty());
    }

    #[test]
    fn channel_with_one_usable_key_remains() {
        let (cache, store) = fixture();
        let a = seed(&store, "a", 10, &["m"]);
        seed_key(&store, a, 0);
        seed_key(&store, a, 1);
        store.set_key_cooldown(a, 0, cooling(60)).unwrap();
        // Key 1 cooled in the past — counts as usable.
        store.set_key_cooldown(a, 1, cooling(-5)).unwrap();

        let names = select(&cache, "m", &ChannelAcl::All);
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn keyless_channel_is_not_treated_as_cooled() {
        let (cache, store) = fixture();
        seed(&store, "open", 10, &["m"]);
        let names = select(&cache, "m", &ChannelAcl::All);
        assert_eq!(names, vec!["open"]);
    }

    // -----------------------------------------------------------------------
    // Load-balance shuffle
    // -----------------------------------------------------------------------

    #[test]
    fn shuffle_preserves_priority_group_boundaries() {
        let (cache, store) = fixture();
        for i in 0..5 {
            seed(&store, &format!("p10-{i}"), 10, &["m"]);
        }
        for i in 0..5 {
            seed(&store, &format!("p20-{i}"), 20, &["m"]);
        }

        let mut settings = RuntimeSettings::default();
        settings.load_balance_enabled = true;

        for _ in 0..10 {
            let list =
                candidates(&cache, &settings, "m", None, &ChannelAcl::All, Utc::now()).unwrap();
            assert_eq!(list.len(), 10);
            // First five entries are always the priority-10 group, in some order.
            assert!(list[..5].iter().all(|c| c.priority == 10));
            assert!(list[5..].iter().all(|c| c.priority == 20));
        }
    }
}
