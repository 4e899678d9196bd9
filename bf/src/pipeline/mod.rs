//! Job execution pipeline
//!
//! - [`compile`] - JobConfiguration validation and compilation
//! - [`workers`] - partitioned record processing
//! - [`orchestrator`] - the execution state machine
//! - [`reconcile`] - post-load count reconciliation
//! - [`metrics`] - per-execution performance figures

mod compile;
mod error;
mod metrics;
mod orchestrator;
mod reconcile;
mod workers;

pub use compile::CompiledJob;
pub use error::PipelineError;
pub use metrics::{ExecutionMetrics, PhaseTiming};
pub use orchestrator::{ExecutionReport, Orchestrator, PipelineSettings};
pub use reconcile::{Reconciliation, reconcile};
pub use workers::{PartitionPool, RecordOutcome};
