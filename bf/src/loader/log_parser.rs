//! Loader log statistics
//!
//! Extracts record counts and elapsed time from the loader's log file. The
//! patterns are configurable; the defaults match SQL*Loader logs.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LoaderError;

/// Regexes used to read a loader log
///
/// Count patterns capture one integer. `rows-loaded` is summed over all
/// matches (one per table); the others use the first match. `elapsed`
/// captures `hh`, `mm`, `ss[.fff]` or a single seconds value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogPatterns {
    pub records_read: String,
    pub rows_loaded: String,
    pub records_rejected: String,
    pub records_discarded: String,
    pub elapsed: String,
}

impl Default for LogPatterns {
    fn default() -> Self {
        Self {
            records_read: r"Total logical records read:\s+(\d+)".to_string(),
            rows_loaded: r"(\d+) Rows? successfully loaded".to_string(),
            records_rejected: r"Total logical records rejected:\s+(\d+)".to_string(),
            records_discarded: r"Total logical records discarded:\s+(\d+)".to_string(),
            elapsed: r"Elapsed time was:\s+(\d+):(\d+):(\d+(?:\.\d+)?)".to_string(),
        }
    }
}

/// Counts reported by the loader
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadStatistics {
    pub records_read: u64,
    pub rows_loaded: u64,
    pub records_rejected: u64,
    pub records_discarded: u64,
    pub elapsed: Option<Duration>,
}

/// Compiled log patterns
#[derive(Debug, Clone)]
pub struct LogParser {
    records_read: Regex,
    rows_loaded: Regex,
    records_rejected: Regex,
    records_discarded: Regex,
    elapsed: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<Regex, LoaderError> {
    Regex::new(pattern).map_err(|e| LoaderError::Parse(format!("invalid {} pattern: {}", name, e)))
}

fn first_count(re: &Regex, text: &str) -> u64 {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

impl LogParser {
    pub fn new(patterns: &LogPatterns) -> Result<Self, LoaderError> {
        Ok(Self {
            records_read: compile("records-read", &patterns.records_read)?,
            rows_loaded: compile("rows-loaded", &patterns.rows_loaded)?,
            records_rejected: compile("records-rejected", &patterns.records_rejected)?,
            records_discarded: compile("records-discarded", &patterns.records_discarded)?,
            elapsed: compile("elapsed", &patterns.elapsed)?,
        })
    }

    pub fn parse(&self, text: &str) -> LoadStatistics {
        let rows_loaded = self
            .rows_loaded
            .captures_iter(text)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            .sum();

        let stats = LoadStatistics {
            records_read: first_count(&self.records_read, text),
            rows_loaded,
            records_rejected: first_count(&self.records_rejected, text),
            records_discarded: first_count(&self.records_discarded, text),
            elapsed: self.parse_elapsed(text),
        };
        debug!(?stats, "LogParser::parse: done");
        stats
    }

    fn parse_elapsed(&self, text: &str) -> Option<Duration> {
        let caps = self.elapsed.captures(text)?;
        let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
        let seconds = match (number(1), number(2), number(3)) {
            (Some(h), Some(m), Some(s)) => h * 3600.0 + m * 60.0 + s,
            (Some(s), None, None) => s,
            _ => return None,
        };
        Duration::try_from_secs_f64(seconds).ok()
    }

    /// Read and parse a log file; a missing log yields zero counts
    pub async fn parse_file(&self, path: &std::path::Path) -> LoadStatistics {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => self.parse(&text),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "LogParser::parse_file: no log");
                LoadStatistics::default()
            }
        }
    }
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new(&LogPatterns::default()).expect("valid default log patterns")
    }
}
