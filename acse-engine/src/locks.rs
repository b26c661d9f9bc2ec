//! Per-entity async locks
//!
//! One mutex per key. Operations on different keys never contend; there is no
//! global lock. Idle entries are dropped by [`EntityLocks::prune`].

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct EntityLocks<K> {
    inner: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for EntityLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> EntityLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Acquire the lock for `key`, waiting if held
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        // the shard guard must be released before awaiting
        let mutex = self.inner.entry(key.clone()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, m| Arc::strong_count(m) > 1);
        before.saturating_sub(self.inner.len())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
