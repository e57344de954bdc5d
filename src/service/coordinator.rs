//! The coordinator binding storage, expiration and persistence.
//!
//! ## Write path
//!
//! validate → compute `expires_at` → admit against the memory cap →
//! mutate the shard → append to the log → index the expiration → tick the
//! auto-snapshot window. The append happens before the acknowledgement;
//! when it fails the in-memory state stands and the caller sees an
//! internal error (durability within one call is at-least-once, recovery
//! leans on snapshots plus the next successful append).
//!
//! ## Startup
//!
//! An existing append log wins over any snapshot; snapshots are only read
//! when the log is disabled or absent. Restored entries with expirations
//! re-seed the TTL heap.
//!
//! ## Lifecycle
//!
//! `Running → Stopping → Stopped`, one way. Operations after `Stopping`
//! fail with `ServiceClosed`. Shutdown stops the background loop and the
//! expirer, takes a final snapshot, syncs and closes the log, and bounds
//! the whole sequence with the configured deadline, logging and moving on
//! when a step overruns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{KvError, Result};
use crate::protocol::StatsResponse;
use crate::storage::{
    now_unix, AppendLog, PersistRecord, ShardedStore, SnapshotStore, StoreOptions, TtlExpirer,
    TtlIndex,
};

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Per-operation request counters plus hit/miss tallies. All relaxed; no
/// counter read ever blocks.
#[derive(Debug, Default)]
struct ServiceStats {
    hits: AtomicU64,
    misses: AtomicU64,
    req_set: AtomicU64,
    req_get: AtomicU64,
    req_del: AtomicU64,
    req_exists: AtomicU64,
    req_ttl: AtomicU64,
}

struct BackgroundLoop {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The key-value service. Create with [`KvService::start`], share via
/// `Arc`, and call [`KvService::shutdown`] exactly once on the way out.
pub struct KvService {
    cfg: Config,
    store: Arc<ShardedStore>,
    ttl: Arc<TtlIndex>,
    aof: Option<AppendLog>,
    rdb: Option<SnapshotStore>,
    stats: ServiceStats,
    started_at: Instant,
    state: AtomicU8,
    /// Timestamps of recent successful writes, pruned to the widest
    /// save-rule window.
    changes: Mutex<Vec<Instant>>,
    max_rule_seconds: u64,
    expirer: Mutex<Option<TtlExpirer>>,
    background: Mutex<Option<BackgroundLoop>>,
}

impl KvService {
    /// Builds the store, recovers persisted state, and spawns the
    /// background workers. Must be called from within a tokio runtime.
    pub fn start(cfg: Config) -> Result<Arc<Self>> {
        let store = Arc::new(ShardedStore::new(StoreOptions {
            shard_count: cfg.storage.shard_count,
            max_key_size: cfg.storage.max_key_size,
            max_value_size: cfg.storage.max_value_size,
            max_memory: cfg.storage.max_memory,
        }));
        let ttl = Arc::new(TtlIndex::new());

        let aof = cfg
            .aof
            .enabled
            .then(|| AppendLog::new(&cfg.aof.file_path, cfg.aof.rewrite_threshold));
        let rdb = cfg
            .rdb
            .enabled
            .then(|| SnapshotStore::new(&cfg.rdb.file_path));

        // Recovery: an existing append log is the source of truth and
        // snapshots are ignored. Without one, fall back to the newest
        // snapshot, then open the (new) log for appends.
        if let Some(aof) = &aof {
            let had_log = Path::new(&cfg.aof.file_path).is_file();
            let records = aof.open_and_replay()?;
            if had_log {
                info!(records = records.len(), "append log replayed");
                restore(&store, &ttl, records)?;
            } else {
                load_snapshot(&store, &ttl, rdb.as_ref());
            }
        } else {
            load_snapshot(&store, &ttl, rdb.as_ref());
        }

        let max_rule_seconds = cfg
            .rdb
            .save_rules
            .iter()
            .map(|r| r.seconds)
            .max()
            .unwrap_or(0);

        let svc = Arc::new(Self {
            store: Arc::clone(&store),
            ttl: Arc::clone(&ttl),
            aof,
            rdb,
            stats: ServiceStats::default(),
            started_at: Instant::now(),
            state: AtomicU8::new(STATE_RUNNING),
            changes: Mutex::new(Vec::new()),
            max_rule_seconds,
            expirer: Mutex::new(Some(TtlExpirer::start(store, ttl))),
            background: Mutex::new(None),
            cfg,
        });
        Self::spawn_background(&svc);
        info!(keys = svc.store.keys(), "service started");
        Ok(svc)
    }

    fn spawn_background(this: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let svc = Arc::clone(this);
        let task = tokio::spawn(async move {
            let mut save_tick = tokio::time::interval(Duration::from_secs(1));
            let mut rewrite_tick = tokio::time::interval(Duration::from_secs(10));
            save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            rewrite_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = save_tick.tick() => svc.maybe_autosave(),
                    _ = rewrite_tick.tick() => svc.maybe_rewrite(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("background loop stopped");
                            return;
                        }
                    }
                }
            }
        });
        *this.background.lock().unwrap() = Some(BackgroundLoop { shutdown_tx, task });
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(KvError::ServiceClosed);
        }
        Ok(())
    }

    /// Stores `value` under `key` with an optional TTL in seconds (0 = no
    /// expiry).
    pub fn set(&self, key: &str, value: Bytes, ttl_seconds: i64) -> Result<()> {
        self.ensure_running()?;
        self.stats.req_set.fetch_add(1, Ordering::Relaxed);
        if ttl_seconds < 0 {
            return Err(KvError::InvalidRequest("ttl must be >= 0".to_string()));
        }
        let expires_at = if ttl_seconds > 0 {
            now_unix() + ttl_seconds
        } else {
            0
        };

        self.store.set_at(key, value.clone(), expires_at)?;

        // Log before acknowledging. The in-memory write stands even if the
        // append fails; the error tells the caller durability is not
        // guaranteed for this particular write.
        if let Some(aof) = &self.aof {
            aof.append_set(key, &value, expires_at)?;
        }
        if expires_at > 0 {
            self.ttl.add(key, expires_at);
        }
        self.record_change();
        self.maybe_autosave();
        Ok(())
    }

    /// Returns the value and its remaining TTL in seconds (`-1` when no
    /// expiry is set).
    pub fn get(&self, key: &str) -> Result<(Bytes, i64)> {
        self.ensure_running()?;
        self.stats.req_get.fetch_add(1, Ordering::Relaxed);
        self.store.validate_key(key)?;
        match self.store.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(KvError::KeyNotFound)
            }
            Some((value, expires_at)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok((value, ttl_remaining(expires_at)))
            }
        }
    }

    /// Removes `key`. Succeeds whether or not the key existed.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_running()?;
        self.stats.req_del.fetch_add(1, Ordering::Relaxed);
        self.store.validate_key(key)?;
        if self.store.delete(key) {
            if let Some(aof) = &self.aof {
                aof.append_del(key)?;
            }
            self.record_change();
            self.maybe_autosave();
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_running()?;
        self.stats.req_exists.fetch_add(1, Ordering::Relaxed);
        self.store.validate_key(key)?;
        let found = self.store.get(key).is_some();
        if found {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    /// Remaining TTL in whole seconds, `-1` when the key has no expiry.
    /// Absent and expired keys report `KeyNotFound`.
    pub fn ttl(&self, key: &str) -> Result<i64> {
        self.ensure_running()?;
        self.stats.req_ttl.fetch_add(1, Ordering::Relaxed);
        self.store.validate_key(key)?;
        match self.store.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(KvError::KeyNotFound)
            }
            Some((_, expires_at)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(ttl_remaining(expires_at))
            }
        }
    }

    /// Counter snapshot. Never fails.
    pub fn stats(&self) -> StatsResponse {
        let mut requests = BTreeMap::new();
        requests.insert("set".to_string(), self.stats.req_set.load(Ordering::Relaxed));
        requests.insert("get".to_string(), self.stats.req_get.load(Ordering::Relaxed));
        requests.insert("del".to_string(), self.stats.req_del.load(Ordering::Relaxed));
        requests.insert(
            "exists".to_string(),
            self.stats.req_exists.load(Ordering::Relaxed),
        );
        requests.insert("ttl".to_string(), self.stats.req_ttl.load(Ordering::Relaxed));
        StatsResponse {
            keys: self.store.keys(),
            memory: self.store.mem_usage(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            requests,
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    /// Writes a snapshot on demand and returns its path.
    pub fn snapshot(&self) -> Result<PathBuf> {
        self.ensure_running()?;
        let Some(rdb) = &self.rdb else {
            return Err(KvError::InvalidRequest("rdb disabled".to_string()));
        };
        let path = rdb.save(&self.store.snapshot_records())?;
        info!(path = %path.display(), "manual snapshot written");
        Ok(path)
    }

    /// Direct access to the underlying store, mainly for tests and
    /// diagnostics.
    pub fn store(&self) -> &ShardedStore {
        &self.store
    }

    fn record_change(&self) {
        self.changes.lock().unwrap().push(Instant::now());
    }

    /// Evaluates the save rules against the trailing change window and
    /// snapshots when any rule is satisfied. A triggered save resets the
    /// whole window.
    fn maybe_autosave(&self) {
        let Some(rdb) = &self.rdb else {
            return;
        };
        if self.cfg.rdb.save_rules.is_empty() {
            return;
        }

        let now = Instant::now();
        let triggered = {
            let mut changes = self.changes.lock().unwrap();
            if self.max_rule_seconds > 0 {
                if let Some(cutoff) = now.checked_sub(Duration::from_secs(self.max_rule_seconds)) {
                    changes.retain(|t| *t > cutoff);
                }
            }
            let hit = self.cfg.rdb.save_rules.iter().any(|rule| {
                if rule.seconds == 0 || rule.changes == 0 {
                    return false;
                }
                let from = now.checked_sub(Duration::from_secs(rule.seconds));
                let count = changes
                    .iter()
                    .filter(|t| from.map_or(true, |f| **t >= f))
                    .count();
                count as u64 >= rule.changes
            });
            if hit {
                changes.clear();
            }
            hit
        };

        if triggered {
            match rdb.save(&self.store.snapshot_records()) {
                Ok(path) => info!(path = %path.display(), "auto snapshot written"),
                Err(err) => warn!(error = %err, "auto snapshot failed"),
            }
        }
    }

    fn maybe_rewrite(&self) {
        let Some(aof) = &self.aof else {
            return;
        };
        if !aof.needs_rewrite() {
            return;
        }
        info!(size = aof.size(), "append log reached rewrite threshold");
        if let Err(err) = aof.rewrite(&self.store.snapshot_records()) {
            warn!(error = %err, "append log rewrite failed");
        }
    }

    /// Graceful shutdown with an overall deadline. Idempotent; later calls
    /// return immediately.
    pub async fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let deadline = self.cfg.server.shutdown_timeout();
        let begun = Instant::now();
        info!("shutting down");

        let background = self.background.lock().unwrap().take();
        if let Some(bg) = background {
            let _ = bg.shutdown_tx.send(true);
            if tokio::time::timeout(remaining(deadline, begun), bg.task)
                .await
                .is_err()
            {
                warn!("background loop did not stop within deadline");
            }
        }

        let expirer = self.expirer.lock().unwrap().take();
        if let Some(expirer) = expirer {
            expirer.stop(remaining(deadline, begun)).await;
        }

        if let Some(rdb) = &self.rdb {
            match rdb.save(&self.store.snapshot_records()) {
                Ok(path) => info!(path = %path.display(), "final snapshot written"),
                Err(err) => error!(error = %err, "final snapshot failed"),
            }
        }
        if let Some(aof) = &self.aof {
            if let Err(err) = aof.sync() {
                warn!(error = %err, "append log sync failed during shutdown");
            }
            if let Err(err) = aof.close() {
                warn!(error = %err, "append log close failed during shutdown");
            }
        }
        self.store.close();
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        info!(elapsed_ms = begun.elapsed().as_millis() as u64, "shutdown complete");
    }
}

fn ttl_remaining(expires_at: i64) -> i64 {
    if expires_at == 0 {
        -1
    } else {
        (expires_at - now_unix()).max(0)
    }
}

fn remaining(deadline: Duration, begun: Instant) -> Duration {
    deadline.saturating_sub(begun.elapsed())
}

/// Applies recovered records and re-seeds the TTL heap.
fn restore(store: &ShardedStore, ttl: &TtlIndex, records: Vec<PersistRecord>) -> Result<()> {
    let now = now_unix();
    for record in records {
        if record.expires_at > 0 && record.expires_at <= now {
            continue;
        }
        store.set_at(&record.key, record.value, record.expires_at)?;
        if record.expires_at > 0 {
            ttl.add(&record.key, record.expires_at);
        }
    }
    Ok(())
}

/// Loads the newest snapshot if one exists. A corrupt snapshot is a
/// startup error in the logs and the service continues with an empty map.
fn load_snapshot(store: &ShardedStore, ttl: &TtlIndex, rdb: Option<&SnapshotStore>) {
    let Some(rdb) = rdb else {
        return;
    };
    match rdb.load_latest() {
        Ok(Some((records, path))) => {
            let count = records.len();
            if let Err(err) = restore(store, ttl, records) {
                error!(error = %err, "snapshot restore failed, starting empty");
            } else {
                info!(path = %path.display(), records = count, "snapshot restored");
            }
        }
        Ok(None) => {}
        Err(err) => {
            error!(error = %err, "snapshot load failed, starting empty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.aof.file_path = dir
            .path()
            .join("appendonly.aof")
            .to_string_lossy()
            .into_owned();
        cfg.rdb.file_path = dir.path().join("dump.rdb").to_string_lossy().into_owned();
        cfg.server.shutdown_timeout = 5;
        cfg
    }

    #[tokio::test]
    async fn set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();

        svc.set("a", Bytes::from_static(b"hello"), 0).unwrap();
        let (value, ttl) = svc.get("a").unwrap();
        assert_eq!(value, Bytes::from_static(b"hello"));
        assert_eq!(ttl, -1);
        assert!(svc.exists("a").unwrap());
        assert_eq!(svc.ttl("a").unwrap(), -1);

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn get_miss_counts_a_miss() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();

        assert!(matches!(svc.get("nope"), Err(KvError::KeyNotFound)));
        let stats = svc.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.requests["get"], 1);

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn delete_absent_key_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();

        let mem_before = svc.store().mem_usage();
        svc.delete("ghost").unwrap();
        assert_eq!(svc.store().mem_usage(), mem_before);
        assert_eq!(svc.stats().keys, 0);

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn negative_ttl_is_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();
        assert!(matches!(
            svc.set("k", Bytes::from_static(b"v"), -1),
            Err(KvError::InvalidRequest(_))
        ));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn memory_cap_is_enforced_before_mutation() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config_in(&dir);
        cfg.storage.max_memory = 64;
        let svc = KvService::start(cfg).unwrap();

        svc.set("k", Bytes::from(vec![b'x'; 40]), 0).unwrap();
        let before = svc.store().mem_usage();
        assert!(matches!(
            svc.set("k2", Bytes::from(vec![b'y'; 40]), 0),
            Err(KvError::MemoryFull)
        ));
        assert_eq!(svc.store().mem_usage(), before);

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn ttl_expiry_reads_as_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();

        svc.set("t", Bytes::from_static(b"\x01"), 1).unwrap();
        assert!(svc.ttl("t").unwrap() >= 0);
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert!(matches!(svc.get("t"), Err(KvError::KeyNotFound)));
        assert!(!svc.exists("t").unwrap());
        assert!(svc.stats().misses >= 1);

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn manual_snapshot_returns_path() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();
        svc.set("k", Bytes::from_static(b"v"), 0).unwrap();

        let path = svc.snapshot().unwrap();
        assert!(path.is_file());

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_with_rdb_disabled_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config_in(&dir);
        cfg.rdb.enabled = false;
        let svc = KvService::start(cfg).unwrap();
        assert!(matches!(svc.snapshot(), Err(KvError::InvalidRequest(_))));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn operations_after_shutdown_fail_closed() {
        let dir = TempDir::new().unwrap();
        let svc = KvService::start(config_in(&dir)).unwrap();
        svc.shutdown().await;

        assert!(matches!(
            svc.set("k", Bytes::from_static(b"v"), 0),
            Err(KvError::ServiceClosed)
        ));
        assert!(matches!(svc.get("k"), Err(KvError::ServiceClosed)));
        assert!(matches!(svc.delete("k"), Err(KvError::ServiceClosed)));

        // a second shutdown is a no-op
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn save_rule_triggers_auto_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config_in(&dir);
        cfg.rdb.save_rules = vec![crate::config::SaveRule {
            seconds: 60,
            changes: 3,
        }];
        let svc = KvService::start(cfg).unwrap();

        for i in 0..3 {
            svc.set(&format!("k{i}"), Bytes::from_static(b"v"), 0).unwrap();
        }
        // the third write evaluates the rules inline
        let dumps: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy().into_owned();
                name.starts_with("dump-") && name.ends_with(".rdb")
            })
            .collect();
        assert!(!dumps.is_empty());

        svc.shutdown().await;
    }
}
