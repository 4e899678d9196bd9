//! Orchestrator - sequences one job execution
//!
//! ```text
//! Initialized -> Validating -> Transforming -> ErrorCheck -> Loading -> PostCheck -> Completed
//!      |             |             |              |            |           |
//!      +-------------+-------------+--------------+------------+-----------+--> Failed | Aborted
//! ```
//!
//! Validation and transformation run per partition in parallel; the
//! threshold decision at `ErrorCheck` governs whether the batch is loaded,
//! re-run after a delay, or aborted.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compile::CompiledJob;
use super::error::PipelineError;
use super::metrics::ExecutionMetrics;
use super::reconcile::{Reconciliation, reconcile};
use super::workers::{PartitionPool, PhaseWorker, RecordOutcome};
use crate::domain::{CorrelationId, JobState, LoadJobExecution, Record};
use crate::events::{AuditEvent, AuditSink, EventEmitter};
use crate::loader::{ArtifactPaths, BulkLoadExecutor, ControlSpecification, LoadAttempt};
use crate::providers::{ConfigurationProvider, LookupProvider, QueryProvider};
use crate::source::{RejectedRecord, SourceBatch, read_batch, write_data_file, write_rejects};
use crate::threshold::{Decision, ErrorThresholdManager, ThresholdStats};
use crate::transform::{LookupCache, TransformationEngine};
use crate::validation::{BusinessRuleRegistry, FieldValidationResult, ValidationContext, ValidationEngine};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Partition workers per phase
    pub workers: usize,
    /// Scratch directory for loader artifacts and job locks
    pub temp_dir: PathBuf,
    pub lookup_ttl: Duration,
    pub lookup_max_entries: usize,
    /// How long a loaded reference key set stays fresh
    pub reference_max_age: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            temp_dir: std::env::temp_dir().join("bulkflow"),
            lookup_ttl: Duration::from_secs(300),
            lookup_max_entries: 10_000,
            reference_max_age: Duration::from_secs(3600),
        }
    }
}

/// Everything known about a finished execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution: LoadJobExecution,
    pub metrics: ExecutionMetrics,
    pub threshold: ThresholdStats,
    pub reconciliation: Option<Reconciliation>,
    pub rejects_file: Option<PathBuf>,
    pub loader_attempts: Vec<LoadAttempt>,
}

impl ExecutionReport {
    pub fn status(&self) -> JobState {
        self.execution.status
    }

    pub fn succeeded(&self) -> bool {
        self.execution.status == JobState::Completed
    }
}

/// Advisory per-job lock held for the whole execution
struct JobLock {
    file: File,
    path: PathBuf,
}

impl JobLock {
    fn acquire(dir: &Path, job_id: &str) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", job_id));
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| PipelineError::Locked(job_id.to_string()))?;
        debug!(path = %path.display(), "JobLock::acquire: locked");
        Ok(Self { file, path })
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release job lock");
        }
    }
}

/// Runs job executions end to end
pub struct Orchestrator {
    settings: PipelineSettings,
    configs: Arc<dyn ConfigurationProvider>,
    lookups: Arc<dyn LookupProvider>,
    queries: Arc<dyn QueryProvider>,
    registry: BusinessRuleRegistry,
    executor: Arc<BulkLoadExecutor>,
    sink: Arc<dyn AuditSink>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        configs: Arc<dyn ConfigurationProvider>,
        lookups: Arc<dyn LookupProvider>,
        queries: Arc<dyn QueryProvider>,
        executor: Arc<BulkLoadExecutor>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        debug!(?settings, "Orchestrator::new: called");
        Self {
            settings,
            configs,
            lookups,
            queries,
            registry: BusinessRuleRegistry::default(),
            executor,
            sink,
        }
    }

    /// Business rules available to `business-rule` validations
    pub fn with_business_rules(mut self, registry: BusinessRuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn executor(&self) -> &Arc<BulkLoadExecutor> {
        &self.executor
    }

    /// Load and compile a job, checking that its loader template exists
    pub async fn compile(&self, job_id: &str) -> Result<CompiledJob, PipelineError> {
        debug!(%job_id, "Orchestrator::compile: called");
        let config = self.configs.load(job_id).await?;
        let job = config.compile(&self.registry)?;
        job.check_template(self.executor.renderer())?;
        Ok(job)
    }

    /// Run a job over the given input files
    ///
    /// Configuration errors and a held job lock are returned as errors; once
    /// the execution starts, failures end it as `Failed` or `Aborted` in the
    /// returned report.
    pub async fn run(
        &self,
        job_id: &str,
        inputs: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, PipelineError> {
        let job = Arc::new(self.compile(job_id).await?);
        self.execute(job, inputs, cancel).await
    }

    /// Run an already compiled job
    pub async fn execute(
        &self,
        job: Arc<CompiledJob>,
        inputs: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, PipelineError> {
        let _lock = JobLock::acquire(&self.settings.temp_dir, job.job_id())?;
        let correlation_id = CorrelationId::new(job.job_id());
        info!(job_id = %job.job_id(), %correlation_id, inputs = inputs.len(), "Starting job execution");

        let mut run = ExecutionRun::new(self, job, correlation_id, cancel.clone());
        run.events.job_started(
            &run.execution.job_id,
            inputs.iter().map(|p| p.display().to_string()).collect(),
        );
        let outcome = run.drive(inputs).await;
        Ok(run.finish(outcome))
    }
}

/// Counts reported back by the loader
#[derive(Debug, Clone, Copy, Default)]
struct LoaderCounts {
    read: u64,
    loaded: u64,
    rejected: u64,
    discarded: u64,
}

/// State of one execution in flight
struct ExecutionRun<'a> {
    orchestrator: &'a Orchestrator,
    job: Arc<CompiledJob>,
    execution: LoadJobExecution,
    events: EventEmitter,
    threshold: Arc<ErrorThresholdManager>,
    validation: ValidationEngine,
    transform: TransformationEngine,
    cancel: CancellationToken,
    metrics: ExecutionMetrics,
    reconciliation: Option<Reconciliation>,
    rejects_file: Option<PathBuf>,
    loader_attempts: Vec<LoadAttempt>,
}

impl<'a> ExecutionRun<'a> {
    fn new(
        orchestrator: &'a Orchestrator,
        job: Arc<CompiledJob>,
        correlation_id: CorrelationId,
        cancel: CancellationToken,
    ) -> Self {
        let settings = &orchestrator.settings;
        let events = EventEmitter::new(orchestrator.sink.clone(), correlation_id.as_str());
        let execution = LoadJobExecution::new(job.job_id(), correlation_id);
        let threshold = Arc::new(ErrorThresholdManager::new(job.config.threshold.clone()));
        let validation = ValidationEngine::new(Arc::new(ValidationContext::new(
            orchestrator.queries.clone(),
            settings.reference_max_age,
        )));
        let transform = TransformationEngine::new(
            orchestrator.lookups.clone(),
            Arc::new(LookupCache::new(settings.lookup_ttl, settings.lookup_max_entries)),
        );
        Self {
            orchestrator,
            job,
            execution,
            events,
            threshold,
            validation,
            transform,
            cancel,
            metrics: ExecutionMetrics::default(),
            reconciliation: None,
            rejects_file: None,
            loader_attempts: Vec::new(),
        }
    }

    fn advance(&mut self, next: JobState) -> Result<(), PipelineError> {
        let from = self.execution.transition(next)?;
        self.events.state_changed(from, next);
        Ok(())
    }

    async fn drive(&mut self, inputs: &[PathBuf]) -> Result<(), PipelineError> {
        let mut batch = self.read_inputs(inputs).await?;
        let records = Arc::new(std::mem::take(&mut batch.records));

        let outcomes = self.process(records.clone()).await?;

        self.advance(JobState::Loading)?;
        let counts = self.load(&batch, &records, outcomes).await?;

        self.advance(JobState::PostCheck)?;
        self.post_check(counts)?;

        self.advance(JobState::Completed)
    }

    async fn read_inputs(&mut self, inputs: &[PathBuf]) -> Result<SourceBatch, PipelineError> {
        let paths = inputs.to_vec();
        let spec = self.job.config.source.clone();
        let batch = tokio::task::spawn_blocking(move || read_batch(&paths, &spec))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        self.execution.stats.records_read = batch.len() as u64;
        info!(correlation_id = %self.execution.correlation_id, records = batch.len(), "Read input batch");
        Ok(batch)
    }

    /// Validating, Transforming and ErrorCheck, including threshold retries
    async fn process(&mut self, records: Arc<Vec<Record>>) -> Result<Vec<RecordOutcome>, PipelineError> {
        let pool = PartitionPool::new(self.orchestrator.settings.workers);
        let worker = PhaseWorker {
            job: self.job.clone(),
            records: records.clone(),
            validation: self.validation.clone(),
            transform: self.transform.clone(),
            threshold: self.threshold.clone(),
            cancel: self.cancel.clone(),
        };
        let total = records.len();
        let mut attempt = 0u32;

        loop {
            self.threshold.record_processed(total as u64);
            let (start_errors, start_warnings) = self.failure_counts();

            if attempt == 0 {
                self.advance(JobState::Validating)?;
            }
            let started = Instant::now();
            let pre = Arc::new(
                pool.run(total, |range| {
                    let worker = worker.clone();
                    async move { worker.validate(range).await }
                })
                .await?,
            );
            let evaluated = pre.iter().filter(|r| r.is_some()).count() as u64;
            self.phase_done(JobState::Validating, attempt, evaluated, (start_errors, start_warnings), started);

            if attempt == 0 {
                self.advance(JobState::Transforming)?;
            }
            let mid = self.failure_counts();
            let started = Instant::now();
            let outcomes = pool
                .run(total, |range| {
                    let worker = worker.clone();
                    let pre = pre.clone();
                    async move { worker.transform(range, &pre).await }
                })
                .await?;
            let transformed = outcomes
                .iter()
                .filter(|o| matches!(o, RecordOutcome::Accepted { .. }))
                .count() as u64;
            self.phase_done(JobState::Transforming, attempt, transformed, mid, started);

            let (errors, warnings) = self.failure_counts();
            self.execution.stats.errors = errors - start_errors;
            self.execution.stats.warnings = warnings - start_warnings;

            if attempt == 0 {
                self.advance(JobState::ErrorCheck)?;
            }
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let decision = self.threshold.decision();
            debug!(%decision, attempt, "ExecutionRun::process: threshold decision");
            match decision {
                Decision::Continue => return Ok(outcomes),
                Decision::Alert => {
                    let reason = self.report_breach(decision);
                    self.events.alert(&reason);
                    return Ok(outcomes);
                }
                Decision::Stop => {
                    let reason = self.report_breach(decision);
                    return Err(PipelineError::ThresholdStop(reason));
                }
                Decision::RetryScheduled { attempt: retry, delay } => {
                    self.report_breach(decision);
                    self.events.emit(AuditEvent::BatchRetryScheduled {
                        correlation_id: self.execution.correlation_id.to_string(),
                        attempt: retry,
                        delay_ms: delay.as_millis() as u64,
                    });
                    warn!(
                        correlation_id = %self.execution.correlation_id,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Re-running batch after threshold breach"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                    }
                    self.transform.cache().invalidate();
                    self.validation.context().reset_for_retry();
                    self.threshold.begin_retry_attempt();
                    self.execution.threshold_retries = retry;
                    attempt = retry;
                }
            }
        }
    }

    fn failure_counts(&self) -> (u64, u64) {
        let counters = self.threshold.counters();
        (counters.errors(), counters.warnings())
    }

    fn phase_done(&mut self, phase: JobState, attempt: u32, records: u64, before: (u64, u64), started: Instant) {
        let (errors, warnings) = self.failure_counts();
        let timing = self
            .metrics
            .record_phase(
                phase,
                attempt,
                records,
                errors - before.0,
                warnings - before.1,
                started.elapsed(),
            )
            .clone();
        info!(
            correlation_id = %self.execution.correlation_id,
            %phase,
            attempt,
            records,
            errors = timing.errors,
            warnings = timing.warnings,
            "Phase completed"
        );
        self.events
            .phase_completed(phase, records, timing.errors, timing.warnings, timing.duration_ms);
    }

    fn report_breach(&mut self, decision: Decision) -> String {
        let stats = self.threshold.stats();
        let reason = stats
            .breach
            .as_ref()
            .map(|b| b.reason.clone())
            .unwrap_or_else(|| decision.to_string());
        self.execution.breach = Some(reason.clone());
        self.events.emit(AuditEvent::ThresholdBreached {
            correlation_id: self.execution.correlation_id.to_string(),
            decision: decision.to_string(),
            reason: reason.clone(),
            errors: stats.errors,
            warnings: stats.warnings,
            processed: stats.processed,
        });
        reason
    }

    /// Write rejects and the data file, then run the loader
    async fn load(
        &mut self,
        batch: &SourceBatch,
        records: &[Record],
        outcomes: Vec<RecordOutcome>,
    ) -> Result<LoaderCounts, PipelineError> {
        let correlation_id = self.execution.correlation_id.clone();
        let mut loadable = Vec::new();
        let mut rejects = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                RecordOutcome::Accepted { record, .. } => loadable.push(record),
                RecordOutcome::Rejected { failures } => rejects.push(RejectedRecord {
                    file: batch.origin(index).unwrap_or_default().to_string(),
                    source: records[index].clone(),
                    reasons: failures
                        .iter()
                        .filter(|f| f.is_error())
                        .map(reason)
                        .collect(),
                }),
                RecordOutcome::Skipped => warn!(index, "Record was never evaluated"),
            }
        }
        self.execution.stats.validation_rejected = rejects.len() as u64;

        if !rejects.is_empty() {
            let path = self
                .orchestrator
                .executor
                .archiver()
                .error_dir()
                .join(format!("{}.rejected.csv", correlation_id));
            let columns = batch.columns.clone();
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_rejects(&target, &rejects, &columns))
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))??;
            self.rejects_file = Some(path);
        }

        if loadable.is_empty() {
            info!(%correlation_id, "No loadable records, skipping loader");
            return Ok(LoaderCounts::default());
        }

        let orchestrator = self.orchestrator;
        let executor = &orchestrator.executor;
        let paths = ArtifactPaths::in_dir(&self.orchestrator.settings.temp_dir, &correlation_id);
        let data_file = paths.data_file.clone();
        let mappings = self.job.mappings.clone();
        let target = self.job.config.target.clone();
        let written = tokio::task::spawn_blocking(move || write_data_file(&data_file, &loadable, &mappings, &target))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        self.execution.stats.records_written = written;

        let spec = ControlSpecification::build(&self.job.config, &self.job.mappings, &correlation_id, paths);
        self.execution.control_file = Some(spec.paths.control_file.clone());
        self.events.emit(AuditEvent::LoaderStarted {
            correlation_id: correlation_id.to_string(),
            control_file: spec.paths.control_file.display().to_string(),
            records: written,
        });

        let started = Instant::now();
        let result = executor
            .execute(
                &spec,
                &self.job.config.loader.template,
                executor.settings().timeout(),
                &self.cancel,
            )
            .await;
        self.metrics.loader_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                self.record_attempts(&result.attempts);
                self.execution.loader_outcome = Some(result.classification);
                self.execution.loader_retries = result.retry_count;
                self.execution.control_file = result
                    .archived
                    .iter()
                    .find(|p| p.extension().is_some_and(|ext| ext == "ctl"))
                    .cloned()
                    .or(Some(result.control_file));
                let stats = result.statistics;
                self.execution.stats.records_loaded = stats.rows_loaded;
                self.execution.stats.records_rejected = stats.records_rejected;
                self.execution.stats.records_discarded = stats.records_discarded;
                self.events.emit(AuditEvent::LoaderCompleted {
                    correlation_id: correlation_id.to_string(),
                    classification: result.classification,
                    loaded: stats.rows_loaded,
                    rejected: stats.records_rejected,
                    discarded: stats.records_discarded,
                    retries: result.retry_count,
                });
                Ok(LoaderCounts {
                    read: stats.records_read,
                    loaded: stats.rows_loaded,
                    rejected: stats.records_rejected,
                    discarded: stats.records_discarded,
                })
            }
            Err(e) => {
                self.record_attempts(e.attempts());
                self.execution.loader_retries = e.retries();
                self.execution.loader_outcome = e.attempts().last().map(|a| a.classification);
                // artifacts written before the loader ever ran
                if let Err(archive_err) = executor.archiver().archive_failure(&spec.paths, correlation_id.as_str()).await
                {
                    warn!(error = %archive_err, "Failed to archive loader artifacts");
                }
                Err(e.into())
            }
        }
    }

    fn record_attempts(&mut self, attempts: &[LoadAttempt]) {
        for attempt in attempts {
            self.events.emit(AuditEvent::LoaderAttempt {
                correlation_id: self.execution.correlation_id.to_string(),
                attempt: attempt.attempt,
                classification: attempt.classification,
                exit_code: attempt.exit_code,
                message: attempt.message.clone(),
            });
        }
        self.loader_attempts.extend_from_slice(attempts);
    }

    fn post_check(&mut self, counts: LoaderCounts) -> Result<(), PipelineError> {
        let result = reconcile(
            &self.job.config.reconciliation,
            self.execution.stats.records_written,
            counts.read,
            counts.loaded,
            counts.rejected,
            counts.discarded,
        );
        self.events.emit(AuditEvent::ReconciliationCompleted {
            correlation_id: self.execution.correlation_id.to_string(),
            expected: result.expected,
            accounted: result.accounted,
            read: result.read,
            allowed: result.allowed,
            matched: result.matched,
        });
        self.reconciliation = Some(result);
        if result.matched {
            info!(correlation_id = %self.execution.correlation_id, expected = result.expected, "Reconciliation matched");
            Ok(())
        } else {
            Err(PipelineError::Reconciliation {
                expected: result.expected,
                accounted: result.accounted,
                read: result.read,
                allowed: result.allowed,
            })
        }
    }

    /// Settle the terminal state and emit the summary
    fn finish(mut self, outcome: Result<(), PipelineError>) -> ExecutionReport {
        if let Err(e) = outcome {
            let message = e.to_string();
            let phase = self.execution.status;
            let settled = if e.is_abort() {
                warn!(correlation_id = %self.execution.correlation_id, %phase, %message, "Job aborted");
                self.execution.abort(&message)
            } else {
                error!(correlation_id = %self.execution.correlation_id, %phase, %message, "Job failed");
                self.events.error(&phase.to_string(), &message);
                self.execution.fail(&message)
            };
            match settled {
                Ok(from) => self.events.state_changed(from, self.execution.status),
                Err(transition) => error!(error = %transition, "Could not settle terminal state"),
            }
        }

        self.metrics.lookup_cache = self.transform.cache().stats();
        self.metrics.reference_cache = self.validation.context().references().stats();
        self.events.job_completed(&self.execution);
        info!(
            correlation_id = %self.execution.correlation_id,
            status = %self.execution.status,
            read = self.execution.stats.records_read,
            loaded = self.execution.stats.records_loaded,
            rejected = self.execution.stats.validation_rejected + self.execution.stats.records_rejected,
            "Job execution finished"
        );

        ExecutionReport {
            threshold: self.threshold.stats(),
            execution: self.execution,
            metrics: self.metrics,
            reconciliation: self.reconciliation,
            rejects_file: self.rejects_file,
            loader_attempts: self.loader_attempts,
        }
    }
}

fn reason(failure: &FieldValidationResult) -> String {
    format!("{} {}: {}", failure.field, failure.rule, failure.message)
}
