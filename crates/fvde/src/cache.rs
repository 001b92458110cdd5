// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A small typed LRU cache for decrypted sectors.

use std::collections::HashMap;
use std::hash::Hash;

/// Least-recently-used cache with a fixed capacity.
///
/// Recency is tracked with a monotonically increasing tick; eviction scans
/// for the stalest entry. Capacities here are small (a thousand sectors)
/// and lookups dominate, so the linear eviction scan is not a bottleneck.
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, (u64, V)>,
    capacity: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            tick: 0,
        }
    }

    /// Looks up `key`, marking the entry as most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(used, value)| {
            *used = tick;
            &*value
        })
    }

    /// Inserts `value`, evicting the least recently used entry when full
    pub fn put(&mut self, key: K, value: V) {
        self.tick += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(stalest) = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&stalest);
            }
        }
        self.entries.insert(key, (self.tick, value));
    }

    /// Drops every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put(1, "one");
        cache.put(2, "two");
        // Touch 1 so 2 becomes the eviction candidate.
        assert_eq!(cache.get(&1), Some(&"one"));
        cache.put(3, "three");

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(&"one"));
        assert_eq!(cache.get(&3), Some(&"three"));
        assert_eq!(cache.len(), 2);
    }

    #[test_log::test]
    fn reinsert_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.put(1, "one");
        cache.put(1, "uno");
        cache.put(2, "two");
        assert_eq!(cache.get(&1), Some(&"uno"));
        assert_eq!(cache.len(), 2);
    }

    #[test_log::test]
    fn clear_empties_the_cache() {
        let mut cache = LruCache::new(4);
        cache.put(1, 1u32);
        cache.put(2, 2u32);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
