//! Bootstrap configuration for ccload.
//!
//! Loaded once at startup from a TOML file (path from `CCLOAD_CONFIG`,
//! default `./ccload.toml`) and validated before the server opens any port.
//! Everything that can change at runtime — cooldown mode, load-balance flag,
//! model-matching relaxations, prices — lives in the `system_settings` table
//! instead (see [`crate::settings`]); this file only holds what the process
//! needs before the store exists, plus tunables that require a restart.
//!
//! The file is optional: a missing file yields the defaults below. Two values
//! come from the environment, not the file:
//!
//! - `CCLOAD_PASS` — admin password, **required**. The check in `main` is
//!   presence-only; the out-of-process admin surface is what consumes the
//!   value.
//! - `CCLOAD_MAX_CONCURRENCY` — cap on concurrent in-flight proxy requests
//!   (default 1000).

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Top-level bootstrap configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logs: LogPipelineConfig,
}

/// Listener and store locations.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Path of the SQLite database (default: `./ccload.db`).
    #[serde(default = "defaults::db_path")]
    pub db_path: String,

    /// Channel-metadata cache TTL in seconds (default: 60).
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Interval between runtime-settings refreshes from the store (default: 5 s).
    #[serde(default = "defaults::settings_reload_secs")]
    pub settings_reload_secs: u64,

    /// Interval between auth-token map reloads (default: 30 s).
    #[serde(default = "defaults::auth_reload_secs")]
    pub auth_reload_secs: u64,

    /// Deadline for draining background workers on shutdown (default: 10 s).
    #[serde(default = "defaults::shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

/// Forward-engine tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// First-byte deadline for streaming attempts, milliseconds.
    /// `0` disables the timer (default: 30 000).
    #[serde(default = "defaults::first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,

    /// Total deadline for non-streaming attempts, seconds (default: 120).
    #[serde(default = "defaults::total_timeout_secs")]
    pub total_timeout_secs: u64,

    /// TCP connect timeout, seconds (default: 10).
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maximum credentials tried per channel in one request (default: 3).
    #[serde(default = "defaults::max_key_retries")]
    pub max_key_retries: usize,

    /// Per-host idle connection cap for the shared client (default: 32).
    #[serde(default = "defaults::pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

/// Log/stats pipeline sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct LogPipelineConfig {
    /// Bounded queue capacity; overflow drops entries (default: 4096).
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Number of batch-insert workers (default: 2).
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Flush a batch at this size (default: 64).
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Flush a partial batch after this many milliseconds (default: 500).
    #[serde(default = "defaults::flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Log-row retention window in days; older rows are truncated (default: 30).
    #[serde(default = "defaults::retention_days")]
    pub retention_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty server config must deserialize")
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty upstream config must deserialize")
    }
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty logs config must deserialize")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            logs: LogPipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, tolerating a missing file (defaults apply).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str::<Self>(&content).context("parsing config TOML")?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.upstream.max_key_retries >= 1,
            "upstream.max_key_retries must be at least 1"
        );
        anyhow::ensure!(
            self.logs.workers >= 1,
            "logs.workers must be at least 1"
        );
        anyhow::ensure!(
            self.logs.batch_size >= 1 && self.logs.batch_size <= self.logs.queue_capacity,
            "logs.batch_size must be in 1..=logs.queue_capacity"
        );
        Ok(())
    }
}

/// Read `CCLOAD_MAX_CONCURRENCY`, defaulting to 1000.
pub fn max_concurrency() -> usize {
    std::env::var("CCLOAD_MAX_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1000)
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn db_path() -> String { "ccload.db".into() }
    pub fn cache_ttl_secs() -> u64 { 60 }
    pub fn settings_reload_secs() -> u64 { 5 }
    pub fn auth_reload_secs() -> u64 { 30 }
    pub fn shutdown_drain_secs() -> u64 { 10 }
    pub fn first_byte_timeout_ms() -> u64 { 30_000 }
    pub fn total_timeout_secs() -> u64 { 120 }
    pub fn connect_timeout_secs() -> u64 { 10 }
    pub fn max_key_retries() -> usize { 3 }
    pub fn pool_max_idle_per_host() -> usize { 32 }
    pub fn queue_capacity() -> usize { 4096 }
    pub fn workers() -> usize { 2 }
    pub fn batch_size() -> usize { 64 }
    pub fn flush_interval_ms() -> u64 { 500 }
    pub fn retention_days() -> i64 { 30 }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Parsing & defaults
    // -----------------------------------------------------------------------

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.cache_ttl_secs, 60);
        assert_eq!(config.upstream.total_timeout_secs, 120);
        assert_eq!(config.upstream.first_byte_timeout_ms, 30_000);
        assert_eq!(config.logs.queue_capacity, 4096);
        assert_eq!(config.logs.retention_days, 30);
    }

    #[test]
    fn partial_section_keeps_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9999

            [upstream]
            first_byte_timeout_ms = 0
            "#,
        )
        .expect("should parse");
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.db_path, "ccload.db");
        assert_eq!(config.upstream.first_byte_timeout_ms, 0);
        assert_eq!(config.upstream.max_key_retries, 3);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = Config::load(Path::new("/definitely/not/here/ccload.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn zero_key_retries_rejected() {
        let config: Config = toml::from_str("[upstream]\nmax_key_retries = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_larger_than_queue_rejected() {
        let config: Config =
            toml::from_str("[logs]\nqueue_capacity = 10\nbatch_size = 100").unwrap();
        assert!(config.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    #[test]
    fn max_concurrency_defaults_without_env() {
        // The variable is not set in the test environment.
        assert_eq!(max_concurrency(), 1000);
    }
}
