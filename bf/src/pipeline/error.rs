//! Pipeline errors

use thiserror::Error;

use crate::domain::{ConfigurationError, InvalidTransition};
use crate::loader::LoaderError;
use crate::source::SourceError;

/// Failure of a job execution
///
/// `Configuration` and `Locked` are raised before the execution starts;
/// everything else ends a started execution as `Failed` or `Aborted`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Job {0} is already running")]
    Locked(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Threshold breached: {0}")]
    ThresholdStop(String),

    #[error(
        "Reconciliation mismatch: expected {expected}, accounted {accounted}, read {read} (tolerance {allowed})"
    )]
    Reconciliation {
        expected: u64,
        accounted: u64,
        read: u64,
        allowed: u64,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Whether the execution ends `Aborted` rather than `Failed`
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::ThresholdStop(_) | Self::Cancelled | Self::Loader(LoaderError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_classification() {
        assert!(PipelineError::Cancelled.is_abort());
        assert!(PipelineError::ThresholdStop("error count 5 reached limit 5".into()).is_abort());
        assert!(PipelineError::Loader(LoaderError::Cancelled).is_abort());
        assert!(!PipelineError::Task("panic".into()).is_abort());
    }

    #[test]
    fn test_reconciliation_message() {
        let err = PipelineError::Reconciliation {
            expected: 100,
            accounted: 90,
            read: 100,
            allowed: 0,
        };
        assert_eq!(
            err.to_string(),
            "Reconciliation mismatch: expected 100, accounted 90, read 100 (tolerance 0)"
        );
    }
}
