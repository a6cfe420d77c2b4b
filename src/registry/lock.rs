//! Identity-keyed async locks.
//!
//! Ownership mutation must be serialized per session id, and heartbeat
//! ingestion per worker id, while unrelated identities proceed in parallel.
//! A single table maps each identity to its own mutex instead of one global
//! lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// A table of per-identity mutexes.
pub struct LockTable {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire the lock for an identity, creating it on first use.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(key).await;
        lock.lock_owned().await
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        // Fast path: lock already exists
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        // Double-check after acquiring write lock
        if let Some(lock) = locks.get(key) {
            return Arc::clone(lock);
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::clone(&lock));
        lock
    }

    /// Drop lock entries nothing currently holds.
    ///
    /// Identities come and go (sessions are deleted, workers demoted); the
    /// table would otherwise grow without bound.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - locks.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let table = Arc::new(LockTable::new());
        let guard = table.acquire("s1").await;

        let table2 = Arc::clone(&table);
        let contender = tokio::spawn(async move {
            let _g = table2.acquire("s1").await;
        });

        // Contender cannot finish while the guard is held.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let table = LockTable::new();
        let _a = table.acquire("s1").await;
        // Must not deadlock.
        let _b = table.acquire("s2").await;
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn prune_removes_unheld_locks() {
        let table = LockTable::new();
        {
            let _g = table.acquire("s1").await;
        }
        let _held = table.acquire("s2").await;

        let pruned = table.prune().await;
        assert_eq!(pruned, 1);
        assert_eq!(table.len().await, 1);
    }
}
