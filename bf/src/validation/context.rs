//! Per-execution validation context
//!
//! Holds the state record-level rules share across workers: the foreign-key
//! reference cache, the uniqueness set, the query provider and the business
//! rule registry. One context lives exactly as long as one execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::Record;
use crate::providers::{ProviderError, QueryProvider};
use crate::transform::CacheStats;

/// A named, pluggable record predicate
#[async_trait]
pub trait BusinessRule: Send + Sync {
    /// `Ok(true)` when the record satisfies the rule
    async fn check(&self, record: &Record) -> Result<bool, String>;
}

/// Business rules available to job configurations, by name
#[derive(Clone, Default)]
pub struct BusinessRuleRegistry {
    rules: HashMap<String, Arc<dyn BusinessRule>>,
}

impl BusinessRuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, rule: Arc<dyn BusinessRule>) {
        let name = name.into();
        debug!(%name, "BusinessRuleRegistry::register: called");
        self.rules.insert(name, rule);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BusinessRule>> {
        self.rules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for BusinessRuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessRuleRegistry").field("rules", &self.names()).finish()
    }
}

struct KeySet {
    keys: Arc<HashSet<String>>,
    loaded_at: Instant,
}

/// Foreign-key existence cache
///
/// Each (table, column) set is loaded once and reloaded only after
/// `max_age`. Loads are serialized so concurrent workers share one fetch.
pub struct ReferenceCache {
    provider: Arc<dyn QueryProvider>,
    sets: DashMap<(String, String), KeySet>,
    max_age: Duration,
    loading: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReferenceCache {
    pub fn new(provider: Arc<dyn QueryProvider>, max_age: Duration) -> Self {
        Self {
            provider,
            sets: DashMap::new(),
            max_age,
            loading: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn fresh(&self, key: &(String, String)) -> Option<Arc<HashSet<String>>> {
        self.sets
            .get(key)
            .filter(|set| set.loaded_at.elapsed() < self.max_age)
            .map(|set| set.keys.clone())
    }

    /// Whether `value` exists in `table.column`
    pub async fn contains(&self, table: &str, column: &str, value: &str) -> Result<bool, ProviderError> {
        let key = (table.to_string(), column.to_string());
        if let Some(keys) = self.fresh(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(keys.contains(value));
        }

        let _guard = self.loading.lock().await;
        // another worker may have loaded it while we waited
        if let Some(keys) = self.fresh(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(keys.contains(value));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%table, %column, "ReferenceCache::contains: loading keys");
        let keys = Arc::new(self.provider.fetch_keys(table, column).await?);
        let found = keys.contains(value);
        self.sets.insert(
            key,
            KeySet {
                keys,
                loaded_at: Instant::now(),
            },
        );
        Ok(found)
    }

    pub fn invalidate(&self) {
        debug!(sets = self.sets.len(), "ReferenceCache::invalidate: called");
        self.sets.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.sets.len(),
        }
    }
}

/// Shared state for record-level rules in one execution
pub struct ValidationContext {
    references: ReferenceCache,
    seen: DashSet<(usize, Vec<String>)>,
    queries: Arc<dyn QueryProvider>,
}

impl ValidationContext {
    pub fn new(queries: Arc<dyn QueryProvider>, reference_max_age: Duration) -> Self {
        Self {
            references: ReferenceCache::new(queries.clone(), reference_max_age),
            seen: DashSet::new(),
            queries,
        }
    }

    pub fn references(&self) -> &ReferenceCache {
        &self.references
    }

    pub fn queries(&self) -> &Arc<dyn QueryProvider> {
        &self.queries
    }

    /// Record a composite key for a uniqueness rule; false when already seen
    pub fn first_occurrence(&self, rule_id: usize, key: Vec<String>) -> bool {
        self.seen.insert((rule_id, key))
    }

    /// Forget batch-scoped state before a batch is re-run
    pub fn reset_for_retry(&self) {
        debug!(seen = self.seen.len(), "ValidationContext::reset_for_retry: called");
        self.seen.clear();
        self.references.invalidate();
    }
}
