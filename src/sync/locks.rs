use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>;

/// Table of async mutexes addressed by key.
///
/// Entries are created on first use and dropped again when the last guard
/// or waiter for a key goes away, so the table only holds keys that are
/// currently being worked on.
pub struct KeyedLocks<K> {
    table: LockTable<K>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;

        KeyedGuard {
            key,
            table: self.table.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds the lock for one key until dropped
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    table: LockTable<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        let idle = table
            .get(&self.key)
            .map_or(false, |slot| Arc::strong_count(slot) == 1);
        if idle {
            table.remove(&self.key);
        }
    }
}
