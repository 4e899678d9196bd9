//! Event Bus - broadcast audit sink
//!
//! The EventBus uses tokio broadcast channels to deliver audit events to all
//! subscribers. The orchestrator emits, consumers (JSONL logger, CLI) subscribe.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::AuditEvent;
use crate::domain::{ExecutionStats, JobState, LoadJobExecution};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Fire-and-forget destination for audit events
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Broadcast audit sink
pub struct EventBus {
    tx: broadcast::Sender<AuditEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl AuditSink for EventBus {
    /// Without subscribers the event is dropped; when the channel is full the
    /// oldest events are dropped.
    fn emit(&self, event: AuditEvent) {
        debug!(
            event_type = event.event_type(),
            correlation_id = event.correlation_id(),
            "EventBus::emit"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Emits events for one execution
///
/// Cheap to clone; fills in the correlation id.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn AuditSink>,
    correlation_id: String,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, correlation_id: impl Into<String>) -> Self {
        Self {
            sink,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn emit(&self, event: AuditEvent) {
        self.sink.emit(event);
    }

    fn id(&self) -> String {
        self.correlation_id.clone()
    }

    pub fn job_started(&self, job_id: &str, input_files: Vec<String>) {
        self.emit(AuditEvent::JobStarted {
            correlation_id: self.id(),
            job_id: job_id.to_string(),
            input_files,
        });
    }

    pub fn state_changed(&self, from: JobState, to: JobState) {
        self.emit(AuditEvent::StateChanged {
            correlation_id: self.id(),
            from,
            to,
        });
    }

    pub fn phase_completed(&self, phase: JobState, records: u64, errors: u64, warnings: u64, duration_ms: u64) {
        self.emit(AuditEvent::PhaseCompleted {
            correlation_id: self.id(),
            phase,
            records,
            errors,
            warnings,
            duration_ms,
        });
    }

    pub fn alert(&self, message: &str) {
        self.emit(AuditEvent::Alert {
            correlation_id: self.id(),
            message: message.to_string(),
        });
    }

    pub fn error(&self, context: &str, message: &str) {
        self.emit(AuditEvent::Error {
            correlation_id: self.id(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }

    pub fn warning(&self, context: &str, message: &str) {
        self.emit(AuditEvent::Warning {
            correlation_id: self.id(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }

    /// Terminal summary for an execution
    pub fn job_completed(&self, execution: &LoadJobExecution) {
        let stats: ExecutionStats = execution.stats.clone();
        self.emit(AuditEvent::JobCompleted {
            correlation_id: self.id(),
            job_id: execution.job_id.clone(),
            status: execution.status,
            stats,
            breach: execution.breach.clone(),
            last_error: execution.last_error.clone(),
            loader_retries: execution.loader_retries,
            threshold_retries: execution.threshold_retries,
            duration_ms: execution.elapsed().num_milliseconds().max(0) as u64,
        });
    }
}

/// Create a shared event bus
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        let emitter = EventEmitter::new(bus.clone(), "employees-1");
        emitter.state_changed(JobState::Initialized, JobState::Validating);
        emitter.alert("error count 5 reached limit 5");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "StateChanged");
        assert_eq!(first.correlation_id(), "employees-1");
        assert!(matches!(rx.recv().await.unwrap(), AuditEvent::Alert { .. }));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(AuditEvent::Warning {
            correlation_id: "c".to_string(),
            context: "test".to_string(),
            message: "dropped".to_string(),
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = create_event_bus();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        EventEmitter::new(bus.clone(), "c").error("loading", "exit code 3");
        assert_eq!(a.recv().await.unwrap().event_type(), "Error");
        assert_eq!(b.recv().await.unwrap().event_type(), "Error");
    }

    #[test]
    fn test_job_completed_summary() {
        let mut execution = LoadJobExecution::new("employees", "employees-1".into());
        execution.fail("loader failed").unwrap();
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        EventEmitter::new(bus.clone(), "employees-1").job_completed(&execution);
        match rx.try_recv().unwrap() {
            AuditEvent::JobCompleted { status, last_error, .. } => {
                assert_eq!(status, JobState::Failed);
                assert_eq!(last_error.as_deref(), Some("loader failed"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
