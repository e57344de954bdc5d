//! Active expiration driven by a min-heap.
//!
//! Lazy expiry (checking on access) leaves never-read keys in memory
//! forever, so a background expirer walks a min-heap of
//! `{key, expires_at}` pairs and evicts entries whose time has passed.
//! Writes never remove superseded heap entries; a popped entry is compared
//! against the live entry under the shard writer lock and discarded when
//! it no longer matches. That stale-entry tolerance keeps the write path
//! at a plain heap push.
//!
//! The heap lock is a leaf: it is always released before the store's shard
//! lock is taken.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::engine::{now_unix, ShardedStore};

/// One pending expiration. Ordered by deadline so a `Reverse` wrapper
/// turns `BinaryHeap` into a min-heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    expires_at: i64,
    key: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The shared min-heap of pending expirations.
#[derive(Debug, Default)]
pub struct TtlIndex {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
}

impl TtlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an expiration deadline for `key`. Earlier deadlines for
    /// the same key stay in the heap and become no-ops when popped.
    pub fn add(&self, key: &str, expires_at: i64) {
        if expires_at <= 0 {
            return;
        }
        let mut heap = self.heap.lock().unwrap();
        heap.push(Reverse(HeapEntry {
            expires_at,
            key: key.to_string(),
        }));
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the expirer should do next, decided with the heap lock held and
/// executed after it is released.
enum Step {
    Sleep(Duration),
    Evict(HeapEntry),
}

/// Handle to the running expirer task.
pub struct TtlExpirer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TtlExpirer {
    /// Spawns the expirer. Must be called from within a tokio runtime.
    pub fn start(store: Arc<ShardedStore>, index: Arc<TtlIndex>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(expirer_loop(store, index, shutdown_rx));
        debug!("ttl expirer started");
        Self { shutdown_tx, task }
    }

    /// Signals shutdown and waits up to `deadline` for the loop to exit.
    /// Entries left in the heap are recovered from the log or snapshot on
    /// the next start.
    pub async fn stop(self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(deadline, self.task).await.is_err() {
            warn!("ttl expirer did not stop within deadline");
        }
    }
}

/// Maximum idle wait between heap checks.
const IDLE_WAIT: Duration = Duration::from_secs(1);

async fn expirer_loop(
    store: Arc<ShardedStore>,
    index: Arc<TtlIndex>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let now = now_unix();
        let step = {
            let mut heap = index.heap.lock().unwrap();
            match heap.peek() {
                None => Step::Sleep(IDLE_WAIT),
                Some(Reverse(top)) if top.expires_at > now => {
                    let until_due = Duration::from_secs((top.expires_at - now) as u64);
                    Step::Sleep(until_due.min(IDLE_WAIT))
                }
                Some(_) => match heap.pop() {
                    Some(Reverse(entry)) => Step::Evict(entry),
                    None => Step::Sleep(IDLE_WAIT),
                },
            }
        };

        match step {
            Step::Evict(entry) => {
                if store.remove_if_expired(&entry.key, entry.expires_at) {
                    trace!(key = %entry.key, "expired key evicted");
                }
            }
            Step::Sleep(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("ttl expirer stopped");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreOptions;
    use bytes::Bytes;

    fn store() -> Arc<ShardedStore> {
        Arc::new(ShardedStore::new(StoreOptions::default()))
    }

    #[test]
    fn heap_pops_earliest_deadline_first() {
        let index = TtlIndex::new();
        index.add("late", 300);
        index.add("early", 100);
        index.add("mid", 200);

        let mut heap = index.heap.lock().unwrap();
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.expires_at))
            .collect();
        assert_eq!(order, vec![100, 200, 300]);
    }

    #[test]
    fn zero_deadline_is_not_indexed() {
        let index = TtlIndex::new();
        index.add("k", 0);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn expirer_evicts_due_keys() {
        let store = store();
        let index = Arc::new(TtlIndex::new());

        let deadline = now_unix() + 1;
        store.set_at("doomed", Bytes::from("v"), deadline).unwrap();
        index.add("doomed", deadline);
        store.set_at("keeper", Bytes::from("v"), 0).unwrap();

        let expirer = TtlExpirer::start(Arc::clone(&store), Arc::clone(&index));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(store.get("doomed").is_none());
        assert_eq!(store.keys(), 1);
        assert!(store.get("keeper").is_some());

        expirer.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn stale_heap_entry_does_not_evict_rewritten_key() {
        let store = store();
        let index = Arc::new(TtlIndex::new());

        let deadline = now_unix() + 1;
        store.set_at("k", Bytes::from("v1"), deadline).unwrap();
        index.add("k", deadline);

        // overwrite without expiry; the heap entry is now stale
        store.set_at("k", Bytes::from("v2"), 0).unwrap();

        let expirer = TtlExpirer::start(Arc::clone(&store), Arc::clone(&index));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(store.get("k").unwrap().0, Bytes::from("v2"));
        expirer.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn expirer_stops_on_signal() {
        let store = store();
        let index = Arc::new(TtlIndex::new());
        let expirer = TtlExpirer::start(store, index);
        // must return well within the deadline even with an empty heap
        expirer.stop(Duration::from_secs(5)).await;
    }
}
