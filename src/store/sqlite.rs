//! SQLite-backed [`Store`].
//!
//! One connection behind a mutex, WAL journal mode, foreign keys on so that
//! deleting a channel or credential cascades to its cooldown rows. All
//! timestamps are stored as unix seconds.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    AuthTokenRecord, Channel, ChannelAcl, ChannelPreset, ChannelType, CooldownRecord, Credential,
    DailyStatRow, Endpoint, KeyStrategy, LogEntry, NewChannel, OauthBundle,
};

pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
create table if not exists channels (
    id integer primary key autoincrement,
    name text not null,
    channel_type text not null,
    preset text,
    base_url text not null,
    priority integer not null default 10,
    enabled integer not null default 1,
    models text not null default '[]',
    redirects text not null default '{}',
    openai_compatible integer not null default 0,
    key_strategy text not null default 'sequential'
);
create table if not exists channel_endpoints (
    id integer primary key autoincrement,
    channel_id integer not null references channels(id) on delete cascade,
    url text not null,
    latency_ms integer,
    active integer not null default 0
);
create table if not exists api_keys (
    channel_id integer not null references channels(id) on delete cascade,
    key_index integer not null,
    api_key text,
    access_token text,
    refresh_token text,
    id_token text,
    token_expires_at integer,
    device_fingerprint text,
    primary key (channel_id, key_index)
);
create table if not exists channel_cooldowns (
    channel_id integer primary key references channels(id) on delete cascade,
    until_ts integer not null,
    set_ts integer not null,
    last_status integer not null
);
create table if not exists key_cooldowns (
    channel_id integer not null,
    key_index integer not null,
    until_ts integer not null,
    set_ts integer not null,
    last_status integer not null,
    primary key (channel_id, key_index),
    foreign key (channel_id, key_index)
        references api_keys(channel_id, key_index) on delete cascade
);
create table if not exists auth_tokens (
    id integer primary key autoincrement,
    name text not null,
    token_hash text not null unique,
    enabled integer not null default 1,
    expires_at integer,
    acl_all integer not null default 1
);
create table if not exists token_channel_acl (
    token_id integer not null references auth_tokens(id) on delete cascade,
    channel_id integer not null,
    primary key (token_id, channel_id)
);
create table if not exists system_settings (
    key text primary key,
    value text not null
);
create table if not exists logs (
    id integer primary key autoincrement,
    ts integer not null,
    token_id integer,
    channel_id integer,
    model_requested text not null,
    model_actual text not null,
    status integer not null,
    duration_ms integer not null,
    streaming integer not null,
    first_byte_ms integer,
    input_tokens integer not null default 0,
    output_tokens integer not null default 0,
    cache_read_tokens integer not null default 0,
    cache_creation_tokens integer not null default 0,
    cost_usd real not null default 0,
    client_ip text,
    error text
);
create index if not exists idx_logs_ts on logs(ts desc);
create index if not exists idx_logs_channel_ts on logs(channel_id, ts desc);
create table if not exists daily_stats (
    day text not null,
    channel_id integer not null,
    model text not null,
    token_id integer not null,
    requests integer not null,
    input_tokens integer not null,
    output_tokens integer not null,
    cost_usd real not null,
    primary key (day, channel_id, model, token_id)
);
";

fn ts_to_dt(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite database {}", path.display()))?;
        Self::init(conn)
    }

    /// Fresh in-memory database. Used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", &"WAL").ok();
        conn.pragma_update(None, "synchronous", &"NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", &"ON")
            .context("enabling foreign keys")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;

        let store = Self { conn: Mutex::new(conn) };
        store.seed_token_salt()?;
        Ok(store)
    }

    /// Generate the global token salt on first boot.
    fn seed_token_salt(&self) -> anyhow::Result<()> {
        if self.setting("token_salt")?.is_none() {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            self.set_setting("token_salt", &hex::encode(bytes))?;
        }
        Ok(())
    }

    /// Liveness probe used by `/health`.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row("select 1", [], |_| Ok(()))
            .context("store ping")?;
        Ok(())
    }

    // -- channels -----------------------------------------------------------

    pub fn insert_channel(&self, ch: &NewChannel) -> anyhow::Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into channels
             (name, channel_type, preset, base_url, priority, enabled, models, redirects,
              openai_compatible, key_strategy)
             values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                ch.name,
                ch.channel_type.as_str(),
                ch.preset.map(|p| p.as_str()),
                ch.base_url,
                ch.priority,
                ch.enabled,
                serde_json::to_string(&ch.models)?,
                serde_json::to_string(&ch.redirects)?,
                ch.openai_compatible,
                match ch.key_strategy {
                    KeyStrategy::Sequential => "sequential",
                    KeyStrategy::RoundRobin => "round_robin",
                },
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_channel(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("delete from channels where id = ?1", params![id])?;
        Ok(())
    }

    pub fn set_channel_enabled(&self, id: i64, enabled: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "update channels set enabled = ?2 where id = ?1",
            params![id, enabled],
        )?;
        Ok(())
    }

    pub fn channel_by_id(&self, id: i64) -> anyhow::Result<Option<Channel>> {
        Ok(self
            .load_channels(Some(id), false)?
            .into_iter()
            .next())
    }

    /// All enabled channels ordered by (priority, id) — the store's canonical
    /// candidate order.
    pub fn enabled_channels(&self) -> anyhow::Result<Vec<Channel>> {
        self.load_channels(None, true)
    }

    pub fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        self.load_channels(None, false)
    }

    fn load_channels(&self, id: Option<i64>, enabled_only: bool) -> anyhow::Result<Vec<Channel>> {
        let conn = self.conn.lock().expect("store lock poisoned");

        let mut endpoints_by_channel: HashMap<i64, Vec<Endpoint>> = HashMap::new();
        {
            let mut stmt = conn.prepare_cached(
                "select channel_id, id, url, latency_ms, active from channel_endpoints order by id",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    Endpoint {
                        id: r.get(1)?,
                        url: r.get(2)?,
                        latency_ms: r.get(3)?,
                        active: r.get(4)?,
                    },
                ))
            })?;
            for row in rows {
                let (cid, ep) = row?;
                endpoints_by_channel.entry(cid).or_default().push(ep);
            }
        }

        let mut key_counts: HashMap<i64, usize> = HashMap::new();
        {
            let mut stmt = conn
                .prepare_cached("select channel_id, count(*) from api_keys group by channel_id")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (cid, n) = row?;
                key_counts.insert(cid, n as usize);
            }
        }

        let sql = format!(
            "select id, name, channel_type, preset, base_url, priority, enabled, models,
                    redirects, openai_compatible, key_strategy
             from channels
             where (?1 is null or id = ?1) {}
             order by priority asc, id asc",
            if enabled_only { "and enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![id], |r| {
            let type_raw: String = r.get(2)?;
            let preset_raw: Option<String> = r.get(3)?;
            let models_raw: String = r.get(7)?;
            let redirects_raw: String = r.get(8)?;
            let strategy_raw: String = r.get(10)?;
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                type_raw,
                preset_raw,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, bool>(6)?,
                models_raw,
                redirects_raw,
                r.get::<_, bool>(9)?,
                strategy_raw,
            ))
        })?;

        let mut channels = Vec::new();
        for row in rows {
            let (id, name, type_raw, preset_raw, base_url, priority, enabled, models_raw,
                redirects_raw, openai_compatible, strategy_raw) = row?;
            let channel_type = ChannelType::parse(&type_raw)
                .with_context(|| format!("channel {id} has unknown type `{type_raw}`"))?;
            let preset = match preset_raw {
                Some(p) => Some(
                    ChannelPreset::parse(&p)
                        .with_context(|| format!("channel {id} has unknown preset `{p}`"))?,
                ),
                None => None,
            };
            channels.push(Channel {
                id,
                name,
                channel_type,
                preset,
                base_url,
                priority,
                enabled,
                models: serde_json::from_str(&models_raw).unwrap_or_default(),
                redirects: serde_json::from_str(&redirects_raw).unwrap_or_default(),
                openai_compatible,
                key_strategy: if strategy_raw == "round_robin" {
                    KeyStrategy::RoundRobin
                } else {
                    KeyStrategy::Sequential
                },
                key_count: key_counts.get(&id).copied().unwrap_or(0),
                endpoints: endpoints_by_channel.remove(&id).unwrap_or_default(),
            });
        }
        Ok(channels)
    }

    // -- endpoints ----------------------------------------------------------

    pub fn insert_endpoint(&self, channel_id: i64, url: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into channel_endpoints (channel_id, url) values (?1, ?2)",
            params![channel_id, url],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark `endpoint_id` active and every sibling inactive, atomically —
    /// enforces the one-active-endpoint invariant.
    pub fn set_active_endpoint(&self, channel_id: i64, endpoint_id: i64) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "update channel_endpoints set active = 0 where channel_id = ?1",
            params![channel_id],
        )?;
        let changed = tx.execute(
            "update channel_endpoints set active = 1 where id = ?1 and channel_id = ?2",
            params![endpoint_id, channel_id],
        )?;
        anyhow::ensure!(changed == 1, "endpoint {endpoint_id} not found on channel {channel_id}");
        tx.commit()?;
        Ok(())
    }

    pub fn record_endpoint_latency(&self, endpoint_id: i64, latency_ms: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "update channel_endpoints set latency_ms = ?2 where id = ?1",
            params![endpoint_id, latency_ms],
        )?;
        Ok(())
    }

    // -- credentials --------------------------------------------------------

    pub fn upsert_credential(&self, cred: &Credential) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into api_keys
             (channel_id, key_index, api_key, access_token, refresh_token, id_token,
              token_expires_at, device_fingerprint)
             values (?1,?2,?3,?4,?5,?6,?7,?8)
             on conflict(channel_id, key_index) do update set
                api_key = excluded.api_key,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                id_token = excluded.id_token,
                token_expires_at = excluded.token_expires_at,
                device_fingerprint = excluded.device_fingerprint",
            params![
                cred.channel_id,
                cred.index as i64,
                cred.api_key,
                cred.oauth.as_ref().map(|o| o.access_token.clone()),
                cred.oauth.as_ref().map(|o| o.refresh_token.clone()),
                cred.oauth.as_ref().and_then(|o| o.id_token.clone()),
                cred.oauth.as_ref().and_then(|o| o.expires_at.map(|t| t.timestamp())),
                cred.device_fingerprint,
            ],
        )?;
        Ok(())
    }

    pub fn delete_credential(&self, channel_id: i64, index: usize) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "delete from api_keys where channel_id = ?1 and key_index = ?2",
            params![channel_id, index as i64],
        )?;
        Ok(())
    }

    /// Credentials of a channel ordered by index. Indices are contiguous from
    /// zero by construction of the admin surface; this method does not reorder.
    pub fn keys_for_channel(&self, channel_id: i64) -> anyhow::Result<Vec<Credential>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare_cached(
            "select key_index, api_key, access_token, refresh_token, id_token,
                    token_expires_at, device_fingerprint
             from api_keys where channel_id = ?1 order by key_index asc",
        )?;
        let rows = stmt.query_map(params![channel_id], |r| {
            let access: Option<String> = r.get(2)?;
            let refresh: Option<String> = r.get(3)?;
            let id_token: Option<String> = r.get(4)?;
            let expires: Option<i64> = r.get(5)?;
            let oauth = match (access, refresh) {
                (Some(access_token), Some(refresh_token)) => Some(OauthBundle {
                    access_token,
                    refresh_token,
                    id_token,
                    expires_at: expires.map(ts_to_dt),
                }),
                _ => None,
            };
            Ok(Credential {
                channel_id,
                index: r.get::<_, i64>(0)? as usize,
                api_key: r.get(1)?,
                oauth,
                device_fingerprint: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Persist refreshed OAuth fields for one credential.
    pub fn update_oauth_tokens(
        &self,
        channel_id: i64,
        index: usize,
        bundle: &OauthBundle,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "update api_keys set access_token = ?3, refresh_token = ?4, id_token = ?5,
                    token_expires_at = ?6
             where channel_id = ?1 and key_index = ?2",
            params![
                channel_id,
                index as i64,
                bundle.access_token,
                bundle.refresh_token,
                bundle.id_token,
                bundle.expires_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    pub fn set_device_fingerprint(
        &self,
        channel_id: i64,
        index: usize,
        fingerprint: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "update api_keys set device_fingerprint = ?3
             where channel_id = ?1 and key_index = ?2",
            params![channel_id, index as i64, fingerprint],
        )?;
        Ok(())
    }

    // -- cooldowns ----------------------------------------------------------

    pub fn all_channel_cooldowns(&self) -> anyhow::Result<HashMap<i64, CooldownRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare_cached(
            "select channel_id, until_ts, set_ts, last_status from channel_cooldowns",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                CooldownRecord {
                    until: ts_to_dt(r.get(1)?),
                    set_at: ts_to_dt(r.get(2)?),
                    last_status: r.get::<_, i64>(3)? as u16,
                },
            ))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    pub fn all_key_cooldowns(&self) -> anyhow::Result<HashMap<(i64, usize), CooldownRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare_cached(
            "select channel_id, key_index, until_ts, set_ts, last_status from key_cooldowns",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                (r.get::<_, i64>(0)?, r.get::<_, i64>(1)? as usize),
                CooldownRecord {
                    until: ts_to_dt(r.get(2)?),
                    set_at: ts_to_dt(r.get(3)?),
                    last_status: r.get::<_, i64>(4)? as u16,
                },
            ))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    pub fn channel_cooldown(&self, channel_id: i64) -> anyhow::Result<Option<CooldownRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn
            .query_row(
                "select until_ts, set_ts, last_status from channel_cooldowns where channel_id = ?1",
                params![channel_id],
                |r| {
                    Ok(CooldownRecord {
                        until: ts_to_dt(r.get(0)?),
                        set_at: ts_to_dt(r.get(1)?),
                        last_status: r.get::<_, i64>(2)? as u16,
                    })
                },
            )
            .optional()?)
    }

    pub fn key_cooldown(
        &self,
        channel_id: i64,
        index: usize,
    ) -> anyhow::Result<Option<CooldownRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn
            .query_row(
                "select until_ts, set_ts, last_status from key_cooldowns
                 where channel_id = ?1 and key_index = ?2",
                params![channel_id, index as i64],
                |r| {
                    Ok(CooldownRecord {
                        until: ts_to_dt(r.get(0)?),
                        set_at: ts_to_dt(r.get(1)?),
                        last_status: r.get::<_, i64>(2)? as u16,
                    })
                },
            )
            .optional()?)
    }

    pub fn set_channel_cooldown(&self, channel_id: i64, rec: CooldownRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into channel_cooldowns (channel_id, until_ts, set_ts, last_status)
             values (?1,?2,?3,?4)
             on conflict(channel_id) do update set
                until_ts = excluded.until_ts,
                set_ts = excluded.set_ts,
                last_status = excluded.last_status",
            params![channel_id, rec.until.timestamp(), rec.set_at.timestamp(), rec.last_status as i64],
        )?;
        Ok(())
    }

    pub fn set_key_cooldown(
        &self,
        channel_id: i64,
        index: usize,
        rec: CooldownRecord,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into key_cooldowns (channel_id, key_index, until_ts, set_ts, last_status)
             values (?1,?2,?3,?4,?5)
             on conflict(channel_id, key_index) do update set
                until_ts = excluded.until_ts,
                set_ts = excluded.set_ts,
                last_status = excluded.last_status",
            params![
                channel_id,
                index as i64,
                rec.until.timestamp(),
                rec.set_at.timestamp(),
                rec.last_status as i64
            ],
        )?;
        Ok(())
    }

    pub fn clear_channel_cooldown(&self, channel_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "delete from channel_cooldowns where channel_id = ?1",
            params![channel_id],
        )?;
        Ok(())
    }

    pub fn clear_key_cooldown(&self, channel_id: i64, index: usize) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "delete from key_cooldowns where channel_id = ?1 and key_index = ?2",
            params![channel_id, index as i64],
        )?;
        Ok(())
    }

    // -- auth tokens --------------------------------------------------------

    pub fn insert_auth_token(
        &self,
        name: &str,
        token_hash: &str,
        enabled: bool,
        expires_at: Option<DateTime<Utc>>,
        acl: &ChannelAcl,
    ) -> anyhow::Result<i64> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "insert into auth_tokens (name, token_hash, enabled, expires_at, acl_all)
             values (?1,?2,?3,?4,?5)",
            params![
                name,
                token_hash,
                enabled,
                expires_at.map(|t| t.timestamp()),
                matches!(acl, ChannelAcl::All),
            ],
        )?;
        let id = tx.last_insert_rowid();
        if let ChannelAcl::Channels(set) = acl {
            for channel_id in set {
                tx.execute(
                    "insert into token_channel_acl (token_id, channel_id) values (?1, ?2)",
                    params![id, channel_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(id)
    }

    /// Map of `token_hash` → record, ACLs joined in. Loaded at boot and on
    /// the auth reload tick, never per-request.
    pub fn load_auth_tokens(&self) -> anyhow::Result<HashMap<String, AuthTokenRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");

        let mut acls: HashMap<i64, HashSet<i64>> = HashMap::new();
        {
            let mut stmt =
                conn.prepare_cached("select token_id, channel_id from token_channel_acl")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (tid, cid) = row?;
                acls.entry(tid).or_default().insert(cid);
            }
        }

        let mut stmt = conn.prepare_cached(
            "select id, name, token_hash, enabled, expires_at, acl_all from auth_tokens",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, bool>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, bool>(5)?,
            ))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (id, name, hash, enabled, expires, acl_all) = row?;
            let acl = if acl_all {
                ChannelAcl::All
            } else {
                ChannelAcl::Channels(acls.remove(&id).unwrap_or_default())
            };
            map.insert(
                hash,
                AuthTokenRecord {
                    id,
                    name,
                    enabled,
                    expires_at: expires.map(ts_to_dt),
                    acl,
                },
            );
        }
        Ok(map)
    }

    // -- settings -----------------------------------------------------------

    pub fn setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn
            .query_row(
                "select value from system_settings where key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into system_settings (key, value) values (?1, ?2)
             on conflict(key) do update set value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn settings_map(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare_cached("select key, value from system_settings")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    // -- logs & daily stats -------------------------------------------------

    pub fn insert_log_batch(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "insert into logs
                 (ts, token_id, channel_id, model_requested, model_actual, status, duration_ms,
                  streaming, first_byte_ms, input_tokens, output_tokens, cache_read_tokens,
                  cache_creation_tokens, cost_usd, client_ip, error)
                 values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            )?;
            for e in entries {
                stmt.execute(params![
                    e.ts.timestamp(),
                    e.token_id,
                    e.channel_id,
                    e.model_requested,
                    e.model_actual,
                    e.status as i64,
                    e.duration_ms,
                    e.streaming,
                    e.first_byte_ms,
                    e.input_tokens,
                    e.output_tokens,
                    e.cache_read_tokens,
                    e.cache_creation_tokens,
                    e.cost_usd,
                    e.client_ip,
                    e.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn log_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn.query_row("select count(*) from logs", [], |r| r.get(0))?)
    }

    /// Delete log rows older than `cutoff`. Returns the number removed.
    pub fn truncate_logs_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn.execute(
            "delete from logs where ts < ?1",
            params![cutoff.timestamp()],
        )?)
    }

    /// Re-aggregate one UTC day (`YYYY-MM-DD`) from `logs` into `daily_stats`.
    /// Idempotent: re-running replaces the day's rows with fresh sums.
    pub fn rollup_day(&self, day: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "insert into daily_stats
                 (day, channel_id, model, token_id, requests, input_tokens, output_tokens, cost_usd)
             select date(ts, 'unixepoch'), ifnull(channel_id, 0), model_actual,
                    ifnull(token_id, 0), count(*), sum(input_tokens), sum(output_tokens),
                    sum(cost_usd)
             from logs
             where date(ts, 'unixepoch') = ?1
             group by 1, 2, 3, 4
             on conflict(day, channel_id, model, token_id) do update set
                requests = excluded.requests,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                cost_usd = excluded.cost_usd",
            params![day],
        )?;
        Ok(())
    }

    /// Distinct UTC days present in `logs` — drives the startup backfill.
    pub fn log_days(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare_cached("select distinct date(ts, 'unixepoch') from logs order by 1")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn daily_stats_since(&self, first_day: &str) -> anyhow::Result<Vec<DailyStatRow>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare_cached(
            "select day, channel_id, model, token_id, requests, input_tokens, output_tokens,
                    cost_usd
             from daily_stats where day >= ?1 order by day asc",
        )?;
        let rows = stmt.query_map(params![first_day], |r| {
            Ok(DailyStatRow {
                day: r.get(0)?,
                channel_id: r.get(1)?,
                model: r.get(2)?,
                token_id: r.get(3)?,
                requests: r.get(4)?,
                input_tokens: r.get(5)?,
                output_tokens: r.get(6)?,
                cost_usd: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
