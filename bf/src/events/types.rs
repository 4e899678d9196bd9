//! Audit event types
//!
//! These events describe everything observable about a job execution:
//! - Lifecycle (start, state changes, completion)
//! - Phase results and threshold decisions
//! - Loader attempts and reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionStats, ExitClassification, JobState};

/// The vocabulary of job execution activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditEvent {
    // === Lifecycle ===
    /// Configuration and correlation id bound
    JobStarted {
        correlation_id: String,
        job_id: String,
        input_files: Vec<String>,
    },
    /// The execution moved to a new state
    StateChanged {
        correlation_id: String,
        from: JobState,
        to: JobState,
    },
    /// A processing phase finished across all partitions
    PhaseCompleted {
        correlation_id: String,
        phase: JobState,
        records: u64,
        errors: u64,
        warnings: u64,
        duration_ms: u64,
    },
    /// Terminal summary
    JobCompleted {
        correlation_id: String,
        job_id: String,
        status: JobState,
        stats: ExecutionStats,
        breach: Option<String>,
        last_error: Option<String>,
        loader_retries: u32,
        threshold_retries: u32,
        duration_ms: u64,
    },

    // === Thresholds ===
    /// A threshold was crossed
    ThresholdBreached {
        correlation_id: String,
        decision: String,
        reason: String,
        errors: u64,
        warnings: u64,
        processed: u64,
    },
    /// A batch will be re-run after a delay
    BatchRetryScheduled {
        correlation_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Threshold alert (processing continues)
    Alert { correlation_id: String, message: String },

    // === Loader ===
    /// Control file written, loader about to run
    LoaderStarted {
        correlation_id: String,
        control_file: String,
        records: u64,
    },
    /// One loader run finished
    LoaderAttempt {
        correlation_id: String,
        attempt: u32,
        classification: ExitClassification,
        exit_code: Option<i32>,
        message: String,
    },
    /// Loader reached the database
    LoaderCompleted {
        correlation_id: String,
        classification: ExitClassification,
        loaded: u64,
        rejected: u64,
        discarded: u64,
        retries: u32,
    },
    /// Expected vs. loaded counts compared
    ReconciliationCompleted {
        correlation_id: String,
        expected: u64,
        accounted: u64,
        read: u64,
        allowed: u64,
        matched: bool,
    },

    // === Errors & Warnings ===
    Error {
        correlation_id: String,
        context: String,
        message: String,
    },
    Warning {
        correlation_id: String,
        context: String,
        message: String,
    },
}

impl AuditEvent {
    /// Correlation id of the execution this event belongs to
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::JobStarted { correlation_id, .. }
            | Self::StateChanged { correlation_id, .. }
            | Self::PhaseCompleted { correlation_id, .. }
            | Self::JobCompleted { correlation_id, .. }
            | Self::ThresholdBreached { correlation_id, .. }
            | Self::BatchRetryScheduled { correlation_id, .. }
            | Self::Alert { correlation_id, .. }
            | Self::LoaderStarted { correlation_id, .. }
            | Self::LoaderAttempt { correlation_id, .. }
            | Self::LoaderCompleted { correlation_id, .. }
            | Self::ReconciliationCompleted { correlation_id, .. }
            | Self::Error { correlation_id, .. }
            | Self::Warning { correlation_id, .. } => correlation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "JobStarted",
            Self::StateChanged { .. } => "StateChanged",
            Self::PhaseCompleted { .. } => "PhaseCompleted",
            Self::JobCompleted { .. } => "JobCompleted",
            Self::ThresholdBreached { .. } => "ThresholdBreached",
            Self::BatchRetryScheduled { .. } => "BatchRetryScheduled",
            Self::Alert { .. } => "Alert",
            Self::LoaderStarted { .. } => "LoaderStarted",
            Self::LoaderAttempt { .. } => "LoaderAttempt",
            Self::LoaderCompleted { .. } => "LoaderCompleted",
            Self::ReconciliationCompleted { .. } => "ReconciliationCompleted",
            Self::Error { .. } => "Error",
            Self::Warning { .. } => "Warning",
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self {
            Self::JobStarted { job_id, input_files, .. } => {
                format!("job {} started ({} input files)", job_id, input_files.len())
            }
            Self::StateChanged { from, to, .. } => format!("{} -> {}", from, to),
            Self::PhaseCompleted {
                phase,
                records,
                errors,
                warnings,
                duration_ms,
                ..
            } => format!(
                "{} finished: {} records, {} errors, {} warnings in {}ms",
                phase, records, errors, warnings, duration_ms
            ),
            Self::JobCompleted { status, stats, .. } => format!(
                "{}: read {}, written {}, loaded {}, rejected {}",
                status,
                stats.records_read,
                stats.records_written,
                stats.records_loaded,
                stats.validation_rejected + stats.records_rejected
            ),
            Self::ThresholdBreached { decision, reason, .. } => format!("threshold breached ({}): {}", decision, reason),
            Self::BatchRetryScheduled { attempt, delay_ms, .. } => {
                format!("batch retry {} in {}ms", attempt, delay_ms)
            }
            Self::Alert { message, .. } => format!("alert: {}", message),
            Self::LoaderStarted { control_file, records, .. } => {
                format!("loader started with {} ({} records)", control_file, records)
            }
            Self::LoaderAttempt {
                attempt,
                classification,
                message,
                ..
            } => format!("loader attempt {}: {} ({})", attempt, classification, message),
            Self::LoaderCompleted {
                classification,
                loaded,
                rejected,
                retries,
                ..
            } => format!(
                "loader {}: {} loaded, {} rejected, {} retries",
                classification, loaded, rejected, retries
            ),
            Self::ReconciliationCompleted {
                expected,
                accounted,
                allowed,
                matched,
                ..
            } => format!(
                "reconciliation {}: expected {}, accounted {}, tolerance {}",
                if *matched { "ok" } else { "mismatch" },
                expected,
                accounted,
                allowed
            ),
            Self::Error { context, message, .. } => format!("error in {}: {}", context, message),
            Self::Warning { context, message, .. } => format!("warning in {}: {}", context, message),
        }
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

impl EventLogEntry {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_and_type() {
        let event = AuditEvent::StateChanged {
            correlation_id: "employees-1".to_string(),
            from: JobState::Validating,
            to: JobState::Transforming,
        };
        assert_eq!(event.correlation_id(), "employees-1");
        assert_eq!(event.event_type(), "StateChanged");
        assert_eq!(event.summary(), "validating -> transforming");
    }

    #[test]
    fn test_serialization() {
        let event = AuditEvent::LoaderAttempt {
            correlation_id: "employees-1".to_string(),
            attempt: 2,
            classification: ExitClassification::Fatal,
            exit_code: Some(3),
            message: "exit code 3".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"LoaderAttempt""#));
        assert!(json.contains(r#""classification":"fatal""#));
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_log_entry() {
        let entry = EventLogEntry::new(AuditEvent::Alert {
            correlation_id: "c".to_string(),
            message: "error count 5 reached limit 5".to_string(),
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""ts""#));
        assert!(json.contains("Alert"));
    }
}
