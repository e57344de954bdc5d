//! Sharded storage engine with memory accounting and TTL support.
//!
//! The keyspace is partitioned into N shards, each guarded by its own
//! `RwLock`, so operations on different keys rarely contend. Every shard
//! also tracks the number of live bytes it holds; the sum of the per-shard
//! counters always equals the engine-wide atomic gauge at lock-quiescent
//! points, and that gauge is what the memory cap is enforced against.
//!
//! ## Concurrency model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    ShardedStore                      │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐    │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │    │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │    │
//! │  │ map+len │ │ map+len │ │ map+len │ │ map+len │    │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘    │
//! │            mem_usage: AtomicI64 (global gauge)       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! At most one shard lock is ever held at a time, including during
//! [`ShardedStore::iterate`], so persistence snapshots never stall writes
//! on other shards.
//!
//! ## Expiration
//!
//! Entries carry an absolute `expires_at` in unix seconds (`0` means no
//! expiry). Reads treat a passed expiration as "not found" and hand the
//! cleanup to the validated-delete path; the active expirer in
//! [`super::ttl`] drives the same path from its min-heap.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

use super::Storage;

/// Current wall-clock time in unix seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A stored value and its absolute expiration (`0` = never).
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    pub expires_at: i64,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now
    }
}

/// A point-in-time copy of one live entry, as consumed by the persistence
/// layers (append log rewrite and snapshots).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRecord {
    pub key: String,
    pub value: Bytes,
    pub expires_at: i64,
}

#[derive(Debug, Default)]
struct ShardData {
    entries: HashMap<String, Entry>,
    bytes: i64,
}

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<ShardData>,
}

/// Construction parameters for [`ShardedStore`]. A zero disables the
/// corresponding limit.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub shard_count: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub max_memory: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shard_count: 256,
            max_key_size: 256,
            max_value_size: 1024 * 1024,
            max_memory: 256 * 1024 * 1024,
        }
    }
}

/// The sharded concurrent map at the heart of the store.
///
/// Designed to be wrapped in an `Arc` and shared between the request
/// handlers and the background workers. All operations take `&self`.
pub struct ShardedStore {
    shards: Vec<Shard>,
    /// `shard_count - 1` when the count is a power of two, otherwise 0 and
    /// selection falls back to modulo.
    shard_mask: u64,
    max_key_size: usize,
    max_value_size: usize,
    max_memory: i64,
    mem_usage: AtomicI64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shards.len())
            .field("mem_usage", &self.mem_usage.load(Ordering::Relaxed))
            .finish()
    }
}

#[inline]
fn entry_size(key: &str, value: &Bytes) -> i64 {
    (key.len() + value.len()) as i64
}

impl ShardedStore {
    pub fn new(opt: StoreOptions) -> Self {
        let shard_count = if opt.shard_count == 0 { 256 } else { opt.shard_count };
        let shards = (0..shard_count).map(|_| Shard::default()).collect();
        let shard_mask = if shard_count.is_power_of_two() {
            (shard_count - 1) as u64
        } else {
            0
        };
        Self {
            shards,
            shard_mask,
            max_key_size: opt.max_key_size,
            max_value_size: opt.max_value_size,
            max_memory: opt.max_memory,
            mem_usage: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// FNV-1a shard selection. The hash must stay stable for the lifetime
    /// of the process so a key always lands on the same shard.
    #[inline]
    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        let h = hasher.finish();
        let idx = if self.shard_mask > 0 {
            (h & self.shard_mask) as usize
        } else {
            (h % self.shards.len() as u64) as usize
        };
        &self.shards[idx]
    }

    /// Rejects empty and oversized keys before any state is touched.
    pub fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidRequest("empty key".to_string()));
        }
        if self.max_key_size > 0 && key.len() > self.max_key_size {
            return Err(KvError::KeyTooLong);
        }
        Ok(())
    }

    fn validate(&self, key: &str, value: &Bytes) -> Result<()> {
        self.validate_key(key)?;
        if self.max_value_size > 0 && value.len() > self.max_value_size {
            return Err(KvError::ValueTooLarge);
        }
        Ok(())
    }

    /// Inserts or overwrites `key` with an absolute expiration timestamp.
    ///
    /// The memory cap is checked before the map is mutated, and the bytes
    /// are reserved with a compare-and-swap so concurrent writers on
    /// different shards cannot jointly overshoot the limit. A rejected
    /// write leaves no trace.
    pub fn set_at(&self, key: &str, value: Bytes, expires_at: i64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::ServiceClosed);
        }
        self.validate(key, &value)?;

        let shard = self.shard(key);
        let mut data = shard.data.write().unwrap();

        let new_size = entry_size(key, &value);
        let delta = match data.entries.get(key) {
            Some(old) => new_size - entry_size(key, &old.value),
            None => new_size,
        };

        if delta > 0 && self.max_memory > 0 {
            let mut current = self.mem_usage.load(Ordering::SeqCst);
            loop {
                if current + delta > self.max_memory {
                    return Err(KvError::MemoryFull);
                }
                match self.mem_usage.compare_exchange(
                    current,
                    current + delta,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        } else {
            self.mem_usage.fetch_add(delta, Ordering::SeqCst);
        }

        data.entries
            .insert(key.to_string(), Entry { value, expires_at });
        data.bytes += delta;
        Ok(())
    }

    /// Returns an owned copy of the value and its `expires_at`, or `None`
    /// when the key is absent or already expired. An expired entry is
    /// handed to the validated-delete path on the way out.
    pub fn get(&self, key: &str) -> Option<(Bytes, i64)> {
        let now = now_unix();
        let entry = {
            let data = self.shard(key).data.read().unwrap();
            data.entries.get(key).cloned()
        };
        match entry {
            Some(e) if e.is_expired(now) => {
                self.remove_if_expired(key, e.expires_at);
                None
            }
            // Bytes is immutable, so the cheap clone cannot alias a
            // writable buffer on either side.
            Some(e) => Some((e.value, e.expires_at)),
            None => None,
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let mut data = shard.data.write().unwrap();
        match data.entries.remove(key) {
            Some(old) => {
                let size = entry_size(key, &old.value);
                data.bytes -= size;
                self.mem_usage.fetch_sub(size, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Deletes `key` only if it still holds the exact expiration the
    /// caller observed and that expiration has passed. Stale requests
    /// (overwritten or already-deleted entries) are silently discarded,
    /// which is what makes re-setting a key with a new TTL safe without
    /// touching the expiration heap.
    pub fn remove_if_expired(&self, key: &str, expires_at: i64) -> bool {
        if expires_at == 0 {
            return false;
        }
        let now = now_unix();
        let shard = self.shard(key);
        let mut data = shard.data.write().unwrap();
        let due = matches!(
            data.entries.get(key),
            Some(e) if e.expires_at == expires_at && e.expires_at <= now
        );
        if !due {
            return false;
        }
        if let Some(old) = data.entries.remove(key) {
            let size = entry_size(key, &old.value);
            data.bytes -= size;
            self.mem_usage.fetch_sub(size, Ordering::SeqCst);
        }
        true
    }

    /// Number of keys currently held, including entries whose expiration
    /// has passed but which have not been evicted yet.
    pub fn keys(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.data.read().unwrap().entries.len())
            .sum()
    }

    /// Live bytes according to the global gauge.
    pub fn mem_usage(&self) -> i64 {
        self.mem_usage.load(Ordering::SeqCst)
    }

    /// Diagnostic: sums the per-shard byte counters. Equals
    /// [`ShardedStore::mem_usage`] whenever no shard lock is held.
    pub fn tracked_bytes(&self) -> i64 {
        self.shards
            .iter()
            .map(|s| s.data.read().unwrap().bytes)
            .sum()
    }

    /// Visits every live (non-expired) entry, one shard lock at a time.
    /// The visitor returns `false` to stop early.
    pub fn iterate(&self, mut visit: impl FnMut(&str, &Bytes, i64) -> bool) {
        let now = now_unix();
        for shard in &self.shards {
            let data = shard.data.read().unwrap();
            for (key, entry) in data.entries.iter() {
                if entry.is_expired(now) {
                    continue;
                }
                if !visit(key, &entry.value, entry.expires_at) {
                    return;
                }
            }
        }
    }

    /// Collects a point-in-time copy of all live entries for the
    /// persistence layers.
    pub fn snapshot_records(&self) -> Vec<PersistRecord> {
        let mut records = Vec::with_capacity(self.keys());
        self.iterate(|key, value, expires_at| {
            records.push(PersistRecord {
                key: key.to_string(),
                value: value.clone(),
                expires_at,
            });
            true
        });
        records
    }

    /// Applies recovered records to the (normally empty) map. Records
    /// whose expiration has already passed are dropped.
    pub fn restore(&self, records: Vec<PersistRecord>) -> Result<()> {
        let now = now_unix();
        for record in records {
            if record.expires_at > 0 && record.expires_at <= now {
                continue;
            }
            self.set_at(&record.key, record.value, record.expires_at)?;
        }
        Ok(())
    }

    /// Marks the store closed; subsequent writes fail with
    /// [`KvError::ServiceClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Storage for ShardedStore {
    fn set(&self, key: &str, value: Bytes, ttl_seconds: i64) -> Result<()> {
        let expires_at = if ttl_seconds > 0 {
            now_unix() + ttl_seconds
        } else {
            0
        };
        self.set_at(key, value, expires_at)
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        ShardedStore::get(self, key).map(|(value, _)| value)
    }

    fn delete(&self, key: &str) -> bool {
        ShardedStore::delete(self, key)
    }

    fn exists(&self, key: &str) -> bool {
        ShardedStore::get(self, key).is_some()
    }

    fn ttl(&self, key: &str) -> Option<i64> {
        ShardedStore::get(self, key).map(|(_, expires_at)| {
            if expires_at == 0 {
                -1
            } else {
                (expires_at - now_unix()).max(0)
            }
        })
    }

    fn keys(&self) -> usize {
        ShardedStore::keys(self)
    }

    fn mem_usage(&self) -> i64 {
        ShardedStore::mem_usage(self)
    }

    fn close(&self) {
        ShardedStore::close(self)
    }
}
