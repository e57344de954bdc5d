//! Storage layer: the sharded in-memory map, the TTL index, and the two
//! persistence backends.
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │         ShardedStore         │
//!              │  N shards, per-shard RwLock  │
//!              └───┬──────────┬──────────┬────┘
//!                  │          │          │
//!        ┌─────────┴──┐  ┌────┴─────┐  ┌─┴────────────┐
//!        │  TtlIndex  │  │ AppendLog│  │ SnapshotStore│
//!        │  min-heap  │  │ SET/DEL  │  │ dump-*.rdb   │
//!        │  expirer   │  │ lines    │  │ bincode+crc  │
//!        └────────────┘  └──────────┘  └──────────────┘
//! ```
//!
//! The service layer owns one of each and wires them together; nothing in
//! here knows about HTTP or configuration files.

pub mod aof;
pub mod engine;
pub mod snapshot;
pub mod ttl;

pub use aof::AppendLog;
pub use engine::{now_unix, Entry, PersistRecord, ShardedStore, StoreOptions};
pub use snapshot::SnapshotStore;
pub use ttl::{TtlExpirer, TtlIndex};

use bytes::Bytes;

use crate::error::Result;

/// The narrow behavioral contract of a key-value store.
///
/// The only production implementation is [`ShardedStore`]; tests can
/// substitute an in-process fake.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`. A `ttl_seconds` of 0 means no expiry.
    fn set(&self, key: &str, value: Bytes, ttl_seconds: i64) -> Result<()>;

    /// Returns an owned copy of the value, or `None` when absent/expired.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Removes `key`; returns whether it was present.
    fn delete(&self, key: &str) -> bool;

    fn exists(&self, key: &str) -> bool;

    /// Remaining lifetime in seconds: `-1` for no expiry, `None` when the
    /// key is absent or already expired.
    fn ttl(&self, key: &str) -> Option<i64>;

    /// Number of keys currently held.
    fn keys(&self) -> usize;

    /// Accounted live bytes.
    fn mem_usage(&self) -> i64;

    /// Stops accepting writes.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharded_store_through_the_trait() {
        let store: Box<dyn Storage> = Box::new(ShardedStore::new(StoreOptions::default()));
        store.set("k", Bytes::from("v"), 0).unwrap();
        assert_eq!(store.get("k"), Some(Bytes::from("v")));
        assert!(store.exists("k"));
        assert_eq!(store.ttl("k"), Some(-1));
        assert_eq!(store.keys(), 1);
        assert!(store.mem_usage() > 0);
        assert!(store.delete("k"));
        assert!(store.get("k").is_none());
    }
}
