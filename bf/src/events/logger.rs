//! Event Logger - persists audit events to JSONL files
//!
//! The EventLogger subscribes to the EventBus and writes all events to
//! per-execution JSONL files for history and replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{AuditEvent, EventLogEntry};

/// Default runs directory: `<data_local_dir>/bulkflow/runs`
pub fn default_runs_dir() -> eyre::Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| eyre::eyre!("Could not determine local data directory"))?;
    Ok(base.join("bulkflow").join("runs"))
}

/// Event logger that writes events to JSONL files
///
/// Events are written to `<runs-dir>/<correlation-id>/events.jsonl`
pub struct EventLogger {
    runs_dir: PathBuf,
    /// Open file writers per execution
    writers: HashMap<String, BufWriter<File>>,
}

impl EventLogger {
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        let runs_dir = runs_dir.as_ref().to_path_buf();
        debug!(?runs_dir, "EventLogger::new: creating logger");
        Self {
            runs_dir,
            writers: HashMap::new(),
        }
    }

    pub fn with_default_path() -> eyre::Result<Self> {
        let runs_dir = default_runs_dir()?;
        fs::create_dir_all(&runs_dir)?;
        Ok(Self::new(runs_dir))
    }

    fn writer_for(&mut self, correlation_id: &str) -> eyre::Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(correlation_id) {
            let exec_dir = self.runs_dir.join(correlation_id);
            fs::create_dir_all(&exec_dir)?;
            let log_path = exec_dir.join("events.jsonl");
            debug!(?log_path, "EventLogger: creating new log file");
            let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            self.writers.insert(correlation_id.to_string(), BufWriter::new(file));
        }
        self.writers
            .get_mut(correlation_id)
            .ok_or_else(|| eyre::eyre!("no writer for {}", correlation_id))
    }

    /// Write an event to its execution's log file
    pub fn write_event(&mut self, event: &AuditEvent) -> eyre::Result<()> {
        let correlation_id = event.correlation_id().to_string();
        debug!(%correlation_id, event_type = event.event_type(), "EventLogger::write_event");
        let json = serde_json::to_string(&EventLogEntry::new(event.clone()))?;
        let writer = self.writer_for(&correlation_id)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    pub fn close_execution(&mut self, correlation_id: &str) {
        debug!(%correlation_id, "EventLogger::close_execution");
        if let Some(mut writer) = self.writers.remove(correlation_id) {
            let _ = writer.flush();
        }
    }

    /// Consume events from the bus until the channel closes
    pub async fn run(mut self, mut rx: broadcast::Receiver<AuditEvent>) {
        debug!("EventLogger::run: starting event logger");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let correlation_id = event.correlation_id().to_string();
                    let is_completed = matches!(event, AuditEvent::JobCompleted { .. });

                    if let Err(e) = self.write_event(&event) {
                        error!(%correlation_id, error = %e, "EventLogger: failed to write event");
                    }
                    if is_completed {
                        self.close_execution(&correlation_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        for (correlation_id, mut writer) in self.writers.drain() {
            debug!(%correlation_id, "EventLogger: flushing writer on shutdown");
            let _ = writer.flush();
        }
    }
}

/// Read events from an execution's log file
pub fn read_execution_events(runs_dir: impl AsRef<Path>, correlation_id: &str) -> eyre::Result<Vec<EventLogEntry>> {
    let log_path = runs_dir.as_ref().join(correlation_id).join("events.jsonl");
    debug!(?log_path, "read_execution_events: reading log file");

    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&log_path)?;
    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_execution_events: failed to parse line"),
        }
    }

    debug!(count = entries.len(), "read_execution_events: loaded entries");
    Ok(entries)
}

/// Spawn the event logger as a background task
///
/// Subscribes before returning, so no event emitted afterwards is missed.
pub fn spawn_event_logger(event_bus: &Arc<EventBus>, runs_dir: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    fs::create_dir_all(runs_dir.as_ref())?;
    let logger = EventLogger::new(runs_dir);
    let rx = event_bus.subscribe();
    Ok(tokio::spawn(logger.run(rx)))
}
