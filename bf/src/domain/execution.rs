//! LoadJobExecution domain type
//!
//! Tracks the lifecycle of one job execution: its correlation id, the state
//! machine position, aggregated record counts and the loader outcome.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::id::CorrelationId;

/// Job execution state
///
/// Moves strictly forward:
/// `Initialized -> Validating -> Transforming -> ErrorCheck -> Loading -> PostCheck -> Completed`.
/// Any non-terminal state may also move to `Failed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Configuration and correlation id bound
    #[default]
    Initialized,
    /// Pre-transformation validation running
    Validating,
    /// Transformation and post-transformation validation running
    Transforming,
    /// Threshold decision pending
    ErrorCheck,
    /// Bulk loader running
    Loading,
    /// Reconciling expected and loaded counts
    PostCheck,
    /// Finished successfully
    Completed,
    /// I/O, loader or reconciliation failure
    Failed,
    /// Threshold stop or external cancellation
    Aborted,
}

impl JobState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// The next state on the success path
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Initialized => Some(Self::Validating),
            Self::Validating => Some(Self::Transforming),
            Self::Transforming => Some(Self::ErrorCheck),
            Self::ErrorCheck => Some(Self::Loading),
            Self::Loading => Some(Self::PostCheck),
            Self::PostCheck => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Aborted => None,
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Failed | Self::Aborted) || self.successor() == Some(next)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Validating => write!(f, "validating"),
            Self::Transforming => write!(f, "transforming"),
            Self::ErrorCheck => write!(f, "error-check"),
            Self::Loading => write!(f, "loading"),
            Self::PostCheck => write!(f, "post-check"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Classification of a loader exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitClassification {
    Success,
    PartialSuccessWithRejects,
    Fatal,
    Timeout,
}

impl std::fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialSuccessWithRejects => write!(f, "partial-success-with-rejects"),
            Self::Fatal => write!(f, "fatal"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Aggregated record counts for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Records read from the input
    pub records_read: u64,
    /// Records written to the loader data file
    pub records_written: u64,
    /// Records rejected before loading (error-severity failures)
    pub validation_rejected: u64,
    /// Rows the loader reported as loaded
    pub records_loaded: u64,
    /// Rows the loader rejected
    pub records_rejected: u64,
    /// Rows the loader discarded
    pub records_discarded: u64,
    /// Error-severity failures counted
    pub errors: u64,
    /// Warning-severity failures counted
    pub warnings: u64,
}

/// Runtime record of one job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadJobExecution {
    pub correlation_id: CorrelationId,

    pub job_id: String,

    pub status: JobState,

    pub started_at: DateTime<Utc>,

    /// Set when a terminal state is reached
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stats: ExecutionStats,

    /// Rendered control file for this execution
    #[serde(default)]
    pub control_file: Option<PathBuf>,

    /// Loader exit classification of the final attempt
    #[serde(default)]
    pub loader_outcome: Option<ExitClassification>,

    /// Loader retries spent
    #[serde(default)]
    pub loader_retries: u32,

    /// Threshold retries spent
    #[serde(default)]
    pub threshold_retries: u32,

    /// Breach description when a threshold tripped
    #[serde(default)]
    pub breach: Option<String>,

    /// Last error message (if any)
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LoadJobExecution {
    /// Create an execution in the `Initialized` state
    pub fn new(job_id: impl Into<String>, correlation_id: CorrelationId) -> Self {
        let job_id = job_id.into();
        debug!(%job_id, %correlation_id, "LoadJobExecution::new: called");
        Self {
            correlation_id,
            job_id,
            status: JobState::Initialized,
            started_at: Utc::now(),
            ended_at: None,
            stats: ExecutionStats::default(),
            control_file: None,
            loader_outcome: None,
            loader_retries: 0,
            threshold_retries: 0,
            breach: None,
            last_error: None,
        }
    }

    /// Move to the next state, rejecting out-of-order transitions
    pub fn transition(&mut self, next: JobState) -> Result<JobState, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            debug!(from = %self.status, to = %next, "LoadJobExecution::transition: rejected");
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(from = %self.status, to = %next, "LoadJobExecution::transition: called");
        let previous = self.status;
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(previous)
    }

    /// Fail from any non-terminal state, keeping the error message
    pub fn fail(&mut self, error: impl Into<String>) -> Result<JobState, InvalidTransition> {
        let previous = self.transition(JobState::Failed)?;
        self.last_error = Some(error.into());
        Ok(previous)
    }

    /// Abort from any non-terminal state
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<JobState, InvalidTransition> {
        let previous = self.transition(JobState::Aborted)?;
        self.last_error = Some(reason.into());
        Ok(previous)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job completed with rejected records
    pub fn completed_with_rejects(&self) -> bool {
        self.status == JobState::Completed
            && (self.stats.validation_rejected > 0 || self.stats.records_rejected > 0)
    }

    /// Wall-clock duration (until now if still running)
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}
