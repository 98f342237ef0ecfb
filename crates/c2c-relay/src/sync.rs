//! Per-key async locking.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Entry count above which unreferenced locks are pruned.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 1024;

/// Per-key async mutex table.
///
/// Operations on the same key are serialized; different keys proceed in
/// parallel. Entries nobody holds are pruned once the table grows past its
/// threshold.
#[derive(Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    prune_threshold: usize,
    name: &'static str,
}

impl KeyedLocks {
    pub fn new(name: &'static str) -> Self {
        Self::with_threshold(name, DEFAULT_PRUNE_THRESHOLD)
    }

    pub fn with_threshold(name: &'static str, prune_threshold: usize) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            prune_threshold,
            name,
        }
    }

    /// Get or create the lock for `key`.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `key`, pruning idle entries first if the table is large.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        if self.locks.len() > self.prune_threshold {
            self.prune();
        }
        self.get(key).lock_owned().await
    }

    /// Drop entries that no caller holds. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        // strong_count == 1: only the table references the lock
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.locks.len(),
                locks = self.name,
                "Pruned idle locks"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
