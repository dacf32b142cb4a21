//! Runtime settings published by the admin surface and read on the hot path.
//!
//! The hot path never queries the store for these: [`SettingsHandle`] holds an
//! atomically-swappable [`Arc<RuntimeSettings>`] that a background tick
//! refreshes from the `system_settings` table. The lock is held only for the
//! duration of `Arc::clone`, so readers never block each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::store::Store;

/// How cooldown durations grow across consecutive failures of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownMode {
    /// Same interval every time.
    Fixed,
    /// Each cooldown doubles the previous one, clamped to a cap.
    Exponential,
}

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub input_per_mtok: f64,
    #[serde(default)]
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_read_per_mtok: f64,
    #[serde(default)]
    pub cache_creation_per_mtok: f64,
}

/// Snapshot of every process-wide tunable the hot path consults.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Shuffle channels within equal-priority groups.
    pub load_balance_enabled: bool,
    pub cooldown_mode: CooldownMode,
    /// Interval for [`CooldownMode::Fixed`], seconds (floor 1).
    pub cooldown_fixed_secs: i64,
    /// Seed duration for [`CooldownMode::Exponential`], seconds.
    pub cooldown_base_secs: i64,
    /// Ceiling for [`CooldownMode::Exponential`], seconds.
    pub cooldown_cap_secs: i64,
    /// Try removing a trailing `-YYYYMMDD` during model matching.
    pub strip_date_fallback: bool,
    /// Case-insensitive substring model matching as a last resort.
    pub fuzzy_model_match: bool,
    /// Model → price table for per-request cost accounting.
    pub prices: HashMap<String, ModelPrice>,
    /// Global salt mixed into auth-token hashes.
    pub token_salt: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            load_balance_enabled: false,
            cooldown_mode: CooldownMode::Exponential,
            cooldown_fixed_secs: 60,
            cooldown_base_secs: 2,
            cooldown_cap_secs: 1800,
            strip_date_fallback: true,
            fuzzy_model_match: false,
            prices: HashMap::new(),
            token_salt: String::new(),
        }
    }
}

fn parse_bool(map: &HashMap<String, String>, key: &str, default: bool) -> bool {
    map.get(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "on" | "yes"))
        .unwrap_or(default)
}

fn parse_i64(map: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    map.get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl RuntimeSettings {
    /// Build a snapshot from the raw `system_settings` key/value rows.
    /// Unknown keys are ignored; malformed values fall back to defaults.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            load_balance_enabled: parse_bool(map, "load_balance_enabled", defaults.load_balance_enabled),
            cooldown_mode: match map.get("cooldown_mode").map(String::as_str) {
                Some("fixed") => CooldownMode::Fixed,
                Some("exponential") => CooldownMode::Exponential,
                _ => defaults.cooldown_mode,
            },
            cooldown_fixed_secs: parse_i64(map, "cooldown_fixed_secs", defaults.cooldown_fixed_secs).max(1),
            cooldown_base_secs: parse_i64(map, "cooldown_base_secs", defaults.cooldown_base_secs).max(1),
            cooldown_cap_secs: parse_i64(map, "cooldown_cap_secs", defaults.cooldown_cap_secs).max(1),
            strip_date_fallback: parse_bool(map, "strip_date_fallback", defaults.strip_date_fallback),
            fuzzy_model_match: parse_bool(map, "fuzzy_model_match", defaults.fuzzy_model_match),
            prices: map
                .get("model_prices")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            token_salt: map.get("token_salt").cloned().unwrap_or_default(),
        }
    }

    /// USD cost of one request given its token counters. Unknown models cost 0.
    pub fn cost_for(
        &self,
        model: &str,
        input: i64,
        output: i64,
        cache_read: i64,
        cache_creation: i64,
    ) -> f64 {
        let Some(price) = self.prices.get(model) else {
            return 0.0;
        };
        const MTOK: f64 = 1_000_000.0;
        input as f64 / MTOK * price.input_per_mtok
            + output as f64 / MTOK * price.output_per_mtok
            + cache_read as f64 / MTOK * price.cache_read_per_mtok
            + cache_creation as f64 / MTOK * price.cache_creation_per_mtok
    }
}

/// Shared handle to the live settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<RuntimeSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(settings))) }
    }

    /// Current snapshot; cheap (`Arc::clone` under a read lock).
    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Atomically publish a new snapshot. Called from the refresh tick.
    pub fn replace(&self, settings: RuntimeSettings) {
        *self.inner.write().expect("settings lock poisoned") = Arc::new(settings);
    }

    /// Re-read the store and publish. Store failures keep the previous
    /// snapshot — the hot path must not degrade on a flaky store.
    pub fn refresh_from(&self, store: &Store) {
        match store.settings_map() {
            Ok(map) => self.replace(RuntimeSettings::from_map(&map)),
            Err(e) => tracing::warn!(error = %e, "settings refresh failed — keeping previous snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn empty_map_yields_defaults() {
        let s = RuntimeSettings::from_map(&HashMap::new());
        assert!(!s.load_balance_enabled);
        assert_eq!(s.cooldown_mode, CooldownMode::Exponential);
        assert!(s.strip_date_fallback);
        assert!(!s.fuzzy_model_match);
    }

    #[test]
    fn fixed_mode_and_flags_parse() {
        let s = RuntimeSettings::from_map(&map(&[
            ("cooldown_mode", "fixed"),
            ("cooldown_fixed_secs", "30"),
            ("load_balance_enabled", "true"),
            ("fuzzy_model_match", "1"),
        ]));
        assert_eq!(s.cooldown_mode, CooldownMode::Fixed);
        assert_eq!(s.cooldown_fixed_secs, 30);
        assert!(s.load_balance_enabled);
        assert!(s.fuzzy_model_match);
    }

    #[test]
    fn fixed_interval_has_one_second_floor() {
        let s = RuntimeSettings::from_map(&map(&[("cooldown_fixed_secs", "0")]));
        assert_eq!(s.cooldown_fixed_secs, 1);
    }

    #[test]
    fn malformed_values_fall_back() {
        let s = RuntimeSettings::from_map(&map(&[
            ("cooldown_mode", "sideways"),
            ("cooldown_cap_secs", "not-a-number"),
        ]));
        assert_eq!(s.cooldown_mode, CooldownMode::Exponential);
        assert_eq!(s.cooldown_cap_secs, 1800);
    }

    // -----------------------------------------------------------------------
    // Cost
    // -----------------------------------------------------------------------

    #[test]
    fn cost_uses_price_table() {
        let s = RuntimeSettings::from_map(&map(&[(
            "model_prices",
            r#"{"claude-sonnet-4-5":{"input_per_mtok":3.0,"output_per_mtok":15.0}}"#,
        )]));
        let cost = s.cost_for("claude-sonnet-4-5", 1_000_000, 1_000_000, 0, 0);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let s = RuntimeSettings::default();
        assert_eq!(s.cost_for("mystery", 1000, 1000, 0, 0), 0.0);
    }

    // -----------------------------------------------------------------------
    // Handle swap
    // -----------------------------------------------------------------------

    #[test]
    fn replace_publishes_new_snapshot() {
        let handle = SettingsHandle::new(RuntimeSettings::default());
        assert!(!handle.snapshot().load_balance_enabled);

        let mut next = RuntimeSettings::default();
        next.load_balance_enabled = true;
        handle.replace(next);
        assert!(handle.snapshot().load_balance_enabled);
    }
}
