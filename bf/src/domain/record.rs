//! Record type shared by source input and transformed output

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One record flowing through the pipeline
///
/// Source records carry source column names; transformed records carry
/// target field names. Both are plain string maps; typing happens in the
/// validation and formatting layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// 1-based line number in the input file (0 for synthetic records)
    pub line: u64,

    /// Field values by name
    pub fields: HashMap<String, String>,
}

impl Record {
    /// Create an empty record for the given line
    pub fn new(line: u64) -> Self {
        Self {
            line,
            fields: HashMap::new(),
        }
    }

    /// Build a record from name/value pairs
    pub fn from_pairs<I, K, V>(line: u64, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            line,
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Get a field value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Set a field value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Check whether a field is present
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
