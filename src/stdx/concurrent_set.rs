//! Concurrent set over a sharded hash map.
//!
//! Thin set facade over `DashMap<K, ()>`, the same shape as the classic
//! "set backed by a concurrent map" wrapper. Used by the cleaner for its
//! live-registration table, where inserts and removes come from arbitrary
//! threads while a sweeper iterates.

use dashmap::DashMap;
use std::hash::Hash;

/// Concurrent insert-if-absent set.
///
/// All operations are lock-free from the caller's perspective (sharded
/// locking internally). Iteration order is unspecified.
#[derive(Debug, Default)]
pub struct ConcurrentSet<K: Eq + Hash> {
    map: DashMap<K, ()>,
}

impl<K: Eq + Hash> ConcurrentSet<K> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Inserts `key`. Returns `true` if it was not already present.
    pub fn insert(&self, key: K) -> bool {
        self.map.insert(key, ()).is_none()
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keeps only the keys for which `f` returns `true`.
    pub fn retain(&self, mut f: impl FnMut(&K) -> bool) {
        self.map.retain(|k, ()| f(k));
    }

    /// Snapshot of the current keys.
    ///
    /// Concurrent mutations may or may not be reflected; callers use this
    /// for sweep passes where staleness is tolerated.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let set = ConcurrentSet::new();
        assert!(set.insert(7u64));
        assert!(!set.insert(7u64));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let set = ConcurrentSet::new();
        set.insert("a");
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));
        assert!(set.is_empty());
    }

    #[test]
    fn retain_filters() {
        let set = ConcurrentSet::new();
        for i in 0..10u32 {
            set.insert(i);
        }
        set.retain(|k| k % 2 == 0);
        assert_eq!(set.len(), 5);
        assert!(set.contains(&4));
        assert!(!set.contains(&5));
    }

    #[test]
    fn concurrent_inserts() {
        use std::sync::Arc;
        let set = Arc::new(ConcurrentSet::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        set.insert(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.len(), 4000);
    }
}
