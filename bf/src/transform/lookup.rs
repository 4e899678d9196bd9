//! Lookup value cache
//!
//! Concurrent (table, key) -> value cache shared by every worker of one
//! execution. Entries expire after a TTL; misses from the provider are cached
//! too so a missing key is not re-queried for every record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<String>,
    inserted: Instant,
}

/// Hit/miss counters for a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hits over total lookups (0.0 when unused)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// TTL-bounded lookup cache
#[derive(Debug)]
pub struct LookupCache {
    entries: DashMap<(String, String), CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LookupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        debug!(ttl_ms = ttl.as_millis() as u64, max_entries, "LookupCache::new: called");
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for (table, key)
    ///
    /// `Some(None)` is a cached miss; `None` means the provider must be asked.
    pub fn get(&self, table: &str, key: &str) -> Option<Option<String>> {
        let cache_key = (table.to_string(), key.to_string());
        let fresh = self
            .entries
            .get(&cache_key)
            .filter(|entry| entry.inserted.elapsed() < self.ttl)
            .map(|entry| entry.value.clone());

        match fresh {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a provider answer; concurrent writers race, last write wins
    pub fn insert(&self, table: &str, key: &str, value: Option<String>) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.len() >= self.max_entries {
            let ttl = self.ttl;
            self.entries.retain(|_, entry| entry.inserted.elapsed() < ttl);
            if self.entries.len() >= self.max_entries {
                debug!(%table, %key, "LookupCache::insert: full, skipping");
                return;
            }
        }
        self.entries.insert(
            (table.to_string(), key.to_string()),
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop every entry
    pub fn invalidate(&self) {
        debug!(entries = self.entries.len(), "LookupCache::invalidate: called");
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = LookupCache::default();
        assert_eq!(cache.get("dept", "10"), None);
        cache.insert("dept", "10", Some("Sales".to_string()));
        assert_eq!(cache.get("dept", "10"), Some(Some("Sales".to_string())));
        cache.insert("dept", "99", None);
        assert_eq!(cache.get("dept", "99"), Some(None));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_scoped_by_table() {
        let cache = LookupCache::default();
        cache.insert("dept", "10", Some("Sales".to_string()));
        assert_eq!(cache.get("region", "10"), None);
    }

    #[test]
    fn test_expiry() {
        let cache = LookupCache::new(Duration::ZERO, 10);
        cache.insert("dept", "10", Some("Sales".to_string()));
        assert_eq!(cache.get("dept", "10"), None);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = LookupCache::new(Duration::from_secs(60), 2);
        cache.insert("t", "a", None);
        cache.insert("t", "b", None);
        cache.insert("t", "c", None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("t", "c"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = LookupCache::default();
        cache.insert("t", "a", Some("1".to_string()));
        cache.invalidate();
        assert!(cache.is_empty());
    }
}
