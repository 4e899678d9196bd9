//! Bulk loader adapter
//!
//! Renders a control specification, runs the external bulk-load utility,
//! parses its log and archives the artifacts.
//!
//! - [`control`] - ControlSpecification rendering and parsing
//! - [`runner`] - subprocess seam
//! - [`log_parser`] - loader log statistics
//! - [`archive`] - artifact archiving
//! - [`executor`] - BulkLoadExecutor

pub mod archive;
pub mod control;
mod embedded;
mod executor;
pub mod log_parser;
pub mod runner;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::domain::ExitClassification;
use crate::retry::RetrySettings;

pub use archive::ArtifactArchiver;
pub use control::{ArtifactPaths, ControlRenderer, ControlSpecification, FieldLayout};
pub use executor::{BulkLoadExecutor, LoadAttempt, LoadResult};
pub use log_parser::{LoadStatistics, LogParser, LogPatterns};
pub use runner::{LoaderCommand, ProcessOutput, ProcessRunner, ProcessStatus, SubprocessRunner};

/// Bulk loader errors
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Loader timed out after {}s ({retries} retries)", .timeout.as_secs())]
    Timeout {
        timeout: Duration,
        retries: u32,
        attempts: Vec<LoadAttempt>,
    },

    #[error("Loader failed: {message} ({retries} retries)")]
    Fatal {
        message: String,
        retries: u32,
        attempts: Vec<LoadAttempt>,
    },

    #[error("Loader cancelled")]
    Cancelled,

    #[error("Loader I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control template error: {0}")]
    Template(String),

    #[error("Invalid control file: {0}")]
    Parse(String),
}

impl LoaderError {
    /// Retries spent before the error was raised
    pub fn retries(&self) -> u32 {
        match self {
            Self::Timeout { retries, .. } | Self::Fatal { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// Per-attempt history, when the loader actually ran
    pub fn attempts(&self) -> &[LoadAttempt] {
        match self {
            Self::Timeout { attempts, .. } | Self::Fatal { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Exit code classification table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExitCodeMap {
    pub success: Vec<i32>,
    pub partial: Vec<i32>,
    pub fatal: Vec<i32>,
}

impl Default for ExitCodeMap {
    fn default() -> Self {
        // SQL*Loader: EX_SUCC 0, EX_FAIL 1, EX_WARN 2, EX_FTL 3
        Self {
            success: vec![0],
            partial: vec![2],
            fatal: vec![1, 3],
        }
    }
}

impl ExitCodeMap {
    /// Classify an exit code; codes in no set are fatal
    pub fn classify(&self, code: i32) -> ExitClassification {
        if self.success.contains(&code) {
            ExitClassification::Success
        } else if self.partial.contains(&code) {
            ExitClassification::PartialSuccessWithRejects
        } else if self.fatal.contains(&code) {
            ExitClassification::Fatal
        } else {
            warn!(code, "Unmapped loader exit code, treating as fatal");
            ExitClassification::Fatal
        }
    }

    /// First code listed in more than one set
    pub fn overlap(&self) -> Option<i32> {
        let sets = [&self.success, &self.partial, &self.fatal];
        sets.iter().enumerate().find_map(|(i, set)| {
            set.iter()
                .copied()
                .find(|code| sets[i + 1..].iter().any(|other| other.contains(code)))
        })
    }
}

/// Loader invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoaderSettings {
    /// Loader executable
    pub command: String,

    /// Argument templates
    pub args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    pub timeout_secs: u64,

    /// Wait between SIGTERM and kill
    pub grace_secs: u64,

    pub exit_codes: ExitCodeMap,

    /// Environment variable holding the loader credentials
    pub userid_env: String,

    pub log_patterns: LogPatterns,

    pub retry: RetrySettings,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            command: "sqlldr".to_string(),
            args: vec![
                "userid={{userid}}".to_string(),
                "control={{control_file}}".to_string(),
                "log={{log_file}}".to_string(),
                "bad={{bad_file}}".to_string(),
                "discard={{discard_file}}".to_string(),
                "silent=header,feedback".to_string(),
            ],
            working_dir: None,
            timeout_secs: 3600,
            grace_secs: 10,
            exit_codes: ExitCodeMap::default(),
            userid_env: "BULKFLOW_USERID".to_string(),
            log_patterns: LogPatterns::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl LoaderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}
