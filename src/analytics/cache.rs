//! Time-bounded cache for derived analytics.
//!
//! Entries expire `ttl` after insertion; expiry is checked on every read.
//! The cache is an ordinary value: build it once and share it by `Arc`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Cache entry with its insertion time.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Lookups that found nothing or found an expired entry.
    pub misses: u64,
    pub entries_added: u64,
    pub entries_evicted: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if no accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_accesses(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Thread-safe TTL cache keyed by request parameters.
///
/// When full, inserting evicts expired entries first and then the oldest.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    max_entries: usize,
    stats: RwLock<CacheStats>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most 1024 entries.
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, 1024)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = {
            let entries = self.entries.read().expect("cache read lock poisoned");
            entries
                .get(key)
                .filter(|entry| entry.created_at.elapsed() < self.ttl)
                .map(|entry| entry.value.clone())
        };

        let mut stats = self.stats.write().expect("stats write lock poisoned");
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().expect("cache write lock poisoned");
        let mut evicted = 0;

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let before = entries.len();
            entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
            evicted += before - entries.len();

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.created_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    evicted += 1;
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );

        let mut stats = self.stats.write().expect("stats write lock poisoned");
        stats.entries_added += 1;
        stats.entries_evicted += evicted as u64;
    }

    /// Drops `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries
            .write()
            .expect("cache write lock poisoned")
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache write lock poisoned").clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read().expect("stats read lock poisoned")
    }
}
