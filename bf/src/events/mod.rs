//! Audit events
//!
//! Every significant step of a job execution emits an [`AuditEvent`] to an
//! [`AuditSink`]. The broadcast [`EventBus`] is the sink used by the binary;
//! the [`EventLogger`] subscribes to it and persists events per correlation id.
//!
//! ```text
//!   Orchestrator ──emit──▶ EventBus (broadcast) ──▶ EventLogger (.jsonl)
//!                                              └──▶ CLI progress
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{AuditSink, DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, NullSink, create_event_bus};
pub use logger::{EventLogger, default_runs_dir, read_execution_events, spawn_event_logger};
pub use types::{AuditEvent, EventLogEntry};
