//! Domain types for BulkFlow
//!
//! Core domain types: JobConfiguration, Record, LoadJobExecution and the
//! correlation id carried through every component of an execution.

mod error;
mod execution;
mod id;
mod job;
mod record;

pub use error::ConfigurationError;
pub use execution::{ExecutionStats, ExitClassification, InvalidTransition, JobState, LoadJobExecution};
pub use id::{CorrelationId, generate_id};
pub(crate) use id::slugify;
pub use job::{
    BreachAction, ConditionalBranch, DataType, FieldFormat, FieldMapping, FieldMappingRule, JobConfiguration,
    LoadMode, LoaderOptions, LoaderTemplateRef, ReconciliationPolicy, RecordFormat, Severity, SignConvention,
    SourceSpec, TargetSpec, ThresholdPolicy, ValidationKind, ValidationRuleConfig, ValidationStage, ValueType,
};
pub use record::Record;
