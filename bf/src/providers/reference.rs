//! Static reference data provider
//!
//! Serves lookups, foreign-key sets and custom-query answers from a YAML
//! document:
//!
//! ```yaml
//! lookups:
//!   departments: { "10": Sales, "20": Engineering }
//! tables:
//!   DEPARTMENTS:
//!     DEPT_ID: ["10", "20"]
//! queries:
//!   "EXISTS account WHERE id = $1 AND status = 'OPEN'":
//!     - ["1001"]
//! ```
//!
//! A query evaluates true when its bindings appear in the listed tuples.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LookupProvider, ProviderError, QueryProvider};

/// Reference data document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    /// table -> key -> value
    pub lookups: HashMap<String, HashMap<String, String>>,

    /// table -> column -> existing values
    pub tables: HashMap<String, HashMap<String, Vec<String>>>,

    /// query text -> binding tuples that satisfy it
    pub queries: HashMap<String, Vec<Vec<String>>>,
}

/// In-memory provider over a [`ReferenceData`] document
#[derive(Debug, Default)]
pub struct StaticReferenceData {
    data: ReferenceData,
    calls: AtomicU64,
}

impl StaticReferenceData {
    pub fn new(data: ReferenceData) -> Self {
        Self {
            data,
            calls: AtomicU64::new(0),
        }
    }

    /// Load a reference data document from YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "StaticReferenceData::from_file: called");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reference data: {}", path.display()))?;
        let data: ReferenceData = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse reference data: {}", path.display()))?;
        Ok(Self::new(data))
    }

    /// Number of provider calls served
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LookupProvider for StaticReferenceData {
    async fn query(&self, table: &str, key: &str) -> Result<Option<String>, ProviderError> {
        debug!(%table, %key, "StaticReferenceData::query: called");
        self.calls.fetch_add(1, Ordering::Relaxed);
        let values = self
            .data
            .lookups
            .get(table)
            .ok_or_else(|| ProviderError::UnknownTable(table.to_string()))?;
        Ok(values.get(key).cloned())
    }
}

#[async_trait]
impl QueryProvider for StaticReferenceData {
    async fn evaluate(&self, predicate: &str, bindings: &[String]) -> Result<bool, ProviderError> {
        debug!(%predicate, ?bindings, "StaticReferenceData::evaluate: called");
        self.calls.fetch_add(1, Ordering::Relaxed);
        let tuples = self
            .data
            .queries
            .get(predicate)
            .ok_or_else(|| ProviderError::Unsupported(predicate.to_string()))?;
        Ok(tuples.iter().any(|tuple| tuple.as_slice() == bindings))
    }

    async fn fetch_keys(&self, table: &str, column: &str) -> Result<HashSet<String>, ProviderError> {
        debug!(%table, %column, "StaticReferenceData::fetch_keys: called");
        self.calls.fetch_add(1, Ordering::Relaxed);
        let keys = self
            .data
            .tables
            .get(table)
            .and_then(|columns| columns.get(column))
            .ok_or_else(|| ProviderError::UnknownTable(format!("{}.{}", table, column)))?;
        Ok(keys.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticReferenceData {
        let data: ReferenceData = serde_yaml::from_str(
            r#"
lookups:
  departments: { "10": Sales }
tables:
  DEPARTMENTS:
    DEPT_ID: ["10", "20"]
queries:
  "open account $1":
    - ["1001"]
"#,
        )
        .unwrap();
        StaticReferenceData::new(data)
    }

    #[tokio::test]
    async fn test_lookup() {
        let p = provider();
        assert_eq!(p.query("departments", "10").await.unwrap(), Some("Sales".to_string()));
        assert_eq!(p.query("departments", "99").await.unwrap(), None);
        assert!(matches!(
            p.query("regions", "1").await,
            Err(ProviderError::UnknownTable(_))
        ));
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test]
    async fn test_fetch_keys() {
        let p = provider();
        let keys = p.fetch_keys("DEPARTMENTS", "DEPT_ID").await.unwrap();
        assert!(keys.contains("20"));
        assert!(p.fetch_keys("DEPARTMENTS", "NAME").await.is_err());
    }

    #[tokio::test]
    async fn test_evaluate() {
        let p = provider();
        assert!(p.evaluate("open account $1", &["1001".to_string()]).await.unwrap());
        assert!(!p.evaluate("open account $1", &["2002".to_string()]).await.unwrap());
        assert!(matches!(
            p.evaluate("other $1", &[]).await,
            Err(ProviderError::Unsupported(_))
        ));
    }
}
