//! External collaborator seams
//!
//! The pipeline consumes job configurations, lookup values and reference
//! data through these async traits. The file and static implementations
//! here back the CLI and the tests; production deployments plug in their
//! own database-backed providers.

mod file;
mod reference;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ConfigurationError, JobConfiguration};

pub use file::FileConfigurationProvider;
pub use reference::{ReferenceData, StaticReferenceData};

/// Provider failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unsupported query: {0}")]
    Unsupported(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a job id to its configuration
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    async fn load(&self, job_id: &str) -> Result<JobConfiguration, ConfigurationError>;
}

/// Key/value lookups for `lookup` mapping rules
#[async_trait]
pub trait LookupProvider: Send + Sync {
    /// Look up `key` in `table`; `Ok(None)` means not found
    async fn query(&self, table: &str, key: &str) -> Result<Option<String>, ProviderError>;
}

/// Reference data for record-level validation rules
#[async_trait]
pub trait QueryProvider: Send + Sync {
    /// Evaluate a parameterized predicate with positional bindings
    async fn evaluate(&self, predicate: &str, bindings: &[String]) -> Result<bool, ProviderError>;

    /// All existing values of `table.column`
    async fn fetch_keys(&self, table: &str, column: &str) -> Result<HashSet<String>, ProviderError>;
}
