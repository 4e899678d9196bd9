//! BulkFlow - validating, transforming bulk-load pipeline
//!
//! BulkFlow reads delimited or fixed-width data files, validates and
//! transforms every record according to a declarative job configuration, and
//! hands the result to an external bulk loader (SQL*Loader by default).
//!
//! # Core Concepts
//!
//! - **Declarative jobs**: mappings, validations and thresholds live in YAML
//! - **Correlation ids**: every event, artifact and log line of an execution carries one
//! - **Error thresholds**: failure rates decide whether a batch loads, retries or aborts
//! - **Reconciliation**: loader counts are checked against what was handed over
//!
//! # Modules
//!
//! - [`domain`] - job configuration, records and execution state
//! - [`source`] - input file reading and output file writing
//! - [`validation`] - field and record validation rules
//! - [`transform`] - field mapping rules, expressions and lookup caching
//! - [`threshold`] - error-threshold accounting and decisions
//! - [`loader`] - control file rendering and loader process supervision
//! - [`pipeline`] - the execution state machine
//! - [`events`] - audit events and their persistence
//! - [`providers`] - configuration, lookup and reference-data sources
//! - [`config`] - application configuration and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod loader;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod source;
pub mod threshold;
pub mod transform;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use domain::{
    ConfigurationError, CorrelationId, ExitClassification, JobConfiguration, JobState, LoadJobExecution, Record,
    Severity,
};
pub use loader::{BulkLoadExecutor, ControlRenderer, LoaderError, LoaderSettings};
pub use pipeline::{CompiledJob, ExecutionReport, Orchestrator, PipelineError, PipelineSettings};
pub use providers::{ConfigurationProvider, LookupProvider, QueryProvider};
pub use threshold::{Decision, ErrorThresholdManager};
pub use transform::TransformationEngine;
pub use validation::{FieldValidationResult, ValidationEngine};

// Events module re-exports
pub use events::{
    AuditEvent, AuditSink, EventBus, EventEmitter, EventLogEntry, EventLogger, create_event_bus,
    read_execution_events, spawn_event_logger,
};
