//! Log / stats write-back pipeline.
//!
//! The hot path never writes the database directly: terminal request records
//! go through [`LogSender::enqueue`], a non-blocking `try_send` into a
//! bounded channel. A small pool of writer workers batch-inserts on size or
//! on a short timer. Overflow drops the entry and bumps a sampled warn
//! counter — losing an accounting row is preferable to stalling a request.
//!
//! Off-pipeline maintenance lives here too: the retention truncator, the
//! daily rollup tick, and the startup backfill that rebuilds `daily_stats`
//! from any log rows that predate it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::LogPipelineConfig;
use crate::store::{LogEntry, Store};

/// Warn once per this many dropped entries.
const DROP_WARN_SAMPLE: u64 = 100;

/// Cheap cloneable handle for enqueuing log entries.
#[derive(Clone)]
pub struct LogSender {
    tx: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogSender {
    /// Non-blocking enqueue. Entries are immutable once accepted.
    pub fn enqueue(&self, entry: LogEntry) {
        if self.tx.try_send(entry).is_err() {
            let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if count % DROP_WARN_SAMPLE == 1 {
                tracing::warn!(total_dropped = count, "log queue full — dropping entries");
            }
        }
    }

    /// Total entries dropped since boot.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Running writer pool. Hold on to it; dropping the last [`LogSender`] and
/// awaiting [`LogWorkers::drain`] is the shutdown sequence.
pub struct LogWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl LogWorkers {
    /// Wait for the workers to flush what remains, bounded by `deadline`.
    /// Returns `false` when the deadline passed and workers were abandoned.
    pub async fn drain(self, deadline: Duration) -> bool {
        let join_all = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(deadline, join_all).await.is_ok()
    }
}

/// Start the writer pool. The channel closes when every [`LogSender`] clone
/// is dropped, after which workers drain and exit.
pub fn start(store: Arc<Store>, cfg: &LogPipelineConfig) -> (LogSender, LogWorkers) {
    let (tx, rx) = mpsc::channel::<LogEntry>(cfg.queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(cfg.workers);
    for worker_id in 0..cfg.workers {
        handles.push(tokio::spawn(worker_loop(
            worker_id,
            store.clone(),
            rx.clone(),
            cfg.batch_size,
            Duration::from_millis(cfg.flush_interval_ms),
        )));
    }

    (
        LogSender { tx, dropped: Arc::new(AtomicU64::new(0)) },
        LogWorkers { handles },
    )
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<Store>,
    rx: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
    loop {
        let closed = {
            let mut rx = rx.lock().await;
            match tokio::time::timeout(flush_interval, rx.recv()).await {
                Ok(Some(entry)) => {
                    batch.push(entry);
                    // Opportunistically top the batch up without waiting.
                    while batch.len() < batch_size {
                        match rx.try_recv() {
                            Ok(entry) => batch.push(entry),
                            Err(_) => break,
                        }
                    }
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            }
        };

        if !batch.is_empty() {
            if let Err(e) = store.insert_log_batch(&batch) {
                tracing::warn!(worker_id, error = %e, lost = batch.len(), "log batch insert failed");
            }
            batch.clear();
        }
        if closed {
            tracing::debug!(worker_id, "log worker drained — exiting");
            break;
        }
    }
}

/// Delete log rows older than the retention window; runs hourly.
pub fn spawn_retention(store: Arc<Store>, retention_days: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
            match store.truncate_logs_before(cutoff) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "log retention truncated old rows"),
                Err(e) => tracing::warn!(error = %e, "log retention failed"),
            }
        }
    })
}

/// Roll up today's and yesterday's stats on an hourly tick. The rollup SQL is
/// idempotent, so re-aggregating a partially-elapsed day is safe.
pub fn spawn_rollup(store: Arc<Store>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let today = chrono::Utc::now().date_naive();
            for day in [today - chrono::Duration::days(1), today] {
                let day = day.format("%Y-%m-%d").to_string();
                if let Err(e) = store.rollup_day(&day) {
                    tracing::warn!(%day, error = %e, "daily rollup failed");
                }
            }
        }
    })
}

/// Startup backfill: aggregate every day present in `logs` so historical
/// queries work even when the rollup table is new or behind.
pub fn backfill_daily_stats(store: &Store) {
    match store.log_days() {
        Ok(days) => {
            for day in &days {
                if let Err(e) = store.rollup_day(day) {
                    tracing::warn!(%day, error = %e, "daily stats backfill failed for day");
                }
            }
            if !days.is_empty() {
                tracing::info!(days = days.len(), "daily stats backfilled");
            }
        }
        Err(e) => tracing::warn!(error = %e, "daily stats backfill could not enumerate days"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(channel_id: i64) -> LogEntry {
        let mut e = LogEntry::new("claude-sonnet-4-5");
        e.channel_id = Some(channel_id);
        e.token_id = Some(1);
        e.status = 200;
        e.input_tokens = 10;
        e.output_tokens = 20;
        e
    }

    fn cfg(queue: usize, batch: usize) -> LogPipelineConfig {
        let mut cfg: LogPipelineConfig = toml::from_str("").unwrap();
        cfg.queue_capacity = queue;
        cfg.batch_size = batch;
        cfg.flush_interval_ms = 20;
        cfg.workers = 2;
        cfg
    }

    // -----------------------------------------------------------------------
    // Enqueue → batch insert
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn entries_reach_the_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (sender, workers) = start(store.clone(), &cfg(64, 8));

        for _ in 0..20 {
            sender.enqueue(entry(1));
        }
        drop(sender);
        assert!(workers.drain(Duration::from_secs(5)).await);
        assert_eq!(store.log_count().unwrap(), 20);
    }

    #[tokio::test]
    async fn partial_batch_flushes_on_timer() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (sender, _workers) = start(store.clone(), &cfg(64, 1000));

        sender.enqueue(entry(1));
        // Far fewer than batch_size entries: only the timer can flush.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.log_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Tiny queue and no worker consuming yet (workers exist but we flood
        // far faster than they drain a 2-entry channel).
        let (tx, _rx) = mpsc::channel::<LogEntry>(2);
        let sender = LogSender { tx, dropped: Arc::new(AtomicU64::new(0)) };

        for _ in 0..10 {
            sender.enqueue(entry(1));
        }
        assert_eq!(sender.dropped(), 8);
        let _ = store;
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn backfill_rebuilds_daily_stats() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_log_batch(&[entry(1), entry(1), entry(2)]).unwrap();

        backfill_daily_stats(&store);

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let rows = store.daily_stats_since(&today).unwrap();
        let total_requests: i64 = rows.iter().map(|r| r.requests).sum();
        assert_eq!(total_requests, 3);
    }
}
