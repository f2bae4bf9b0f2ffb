use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Guard for one scoped lock. The lock is released when the guard drops,
/// on every exit path including panics.
pub type LockGuard = ArcMutexGuard<RawMutex, ()>;

/// Process-wide manager of exclusive locks keyed by string.
///
/// Callers never hold the registry lock while waiting: the per-key mutex
/// is cloned out first. When several keys must be held at once,
/// [`LockManager::lock_many`] acquires them in sorted key order so two
/// callers can never deadlock on opposite orderings.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `key`, blocking until available.
    pub fn lock(&self, key: &str) -> LockGuard {
        let entry = {
            let mut map = self.locks.lock();
            // Drop registry entries nobody is waiting on.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        entry.lock_arc()
    }

    /// Acquire several locks at once, in sorted key order.
    pub fn lock_many(&self, keys: &[&str]) -> Vec<LockGuard> {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|key| self.lock(key)).collect()
    }

    /// Number of keys currently registered (held or contended).
    pub fn active(&self) -> usize {
        let mut map = self.locks.lock();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.len()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("active", &self.active())
            .finish()
    }
}
