//! BulkLoadExecutor
//!
//! Writes the control file, runs the loader with retries and parses the
//! outcome. Partial success is final; fatal exits and timeouts are retried
//! with backoff, then escalated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use handlebars::Handlebars;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::ArtifactArchiver;
use super::control::{ControlRenderer, ControlSpecification};
use super::log_parser::{LoadStatistics, LogParser};
use super::runner::{LoaderCommand, ProcessOutput, ProcessRunner, ProcessStatus};
use super::{LoaderError, LoaderSettings};
use crate::domain::ExitClassification;
use crate::retry::RetryStep;

/// One loader run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    pub classification: ExitClassification,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub message: String,
}

/// Outcome of a load that reached the database
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// `Success` or `PartialSuccessWithRejects`
    pub classification: ExitClassification,
    pub statistics: LoadStatistics,
    pub retry_count: u32,
    pub attempts: Vec<LoadAttempt>,
    pub control_file: PathBuf,
    pub archived: Vec<PathBuf>,
}

#[derive(Serialize)]
struct ArgContext<'a> {
    control_file: String,
    data_file: String,
    log_file: String,
    bad_file: String,
    discard_file: String,
    correlation_id: &'a str,
    table: &'a str,
    userid: String,
}

/// Drives the external bulk-load utility
pub struct BulkLoadExecutor {
    settings: LoaderSettings,
    runner: Arc<dyn ProcessRunner>,
    renderer: Arc<ControlRenderer>,
    parser: LogParser,
    archiver: ArtifactArchiver,
    hbs: Handlebars<'static>,
}

impl BulkLoadExecutor {
    pub fn new(
        settings: LoaderSettings,
        runner: Arc<dyn ProcessRunner>,
        renderer: Arc<ControlRenderer>,
        archiver: ArtifactArchiver,
    ) -> Result<Self, LoaderError> {
        debug!(command = %settings.command, "BulkLoadExecutor::new: called");
        let parser = LogParser::new(&settings.log_patterns)?;
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(true);
        hbs.register_escape_fn(handlebars::no_escape);
        Ok(Self {
            settings,
            runner,
            renderer,
            parser,
            archiver,
            hbs,
        })
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn renderer(&self) -> &Arc<ControlRenderer> {
        &self.renderer
    }

    pub fn archiver(&self) -> &ArtifactArchiver {
        &self.archiver
    }

    /// Render the loader command line for a specification
    pub fn command_for(&self, spec: &ControlSpecification) -> Result<LoaderCommand, LoaderError> {
        let userid = std::env::var(&self.settings.userid_env).unwrap_or_else(|_| {
            debug!(var = %self.settings.userid_env, "BulkLoadExecutor::command_for: userid variable not set");
            String::new()
        });
        let context = ArgContext {
            control_file: spec.paths.control_file.display().to_string(),
            data_file: spec.paths.data_file.display().to_string(),
            log_file: spec.paths.log_file.display().to_string(),
            bad_file: spec.paths.bad_file.display().to_string(),
            discard_file: spec.paths.discard_file.display().to_string(),
            correlation_id: &spec.correlation_id,
            table: &spec.table,
            userid,
        };
        let args = self
            .settings
            .args
            .iter()
            .map(|arg| {
                self.hbs
                    .render_template(arg, &context)
                    .map_err(|e| LoaderError::Template(format!("failed to render argument '{}': {}", arg, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LoaderCommand {
            program: self.settings.command.clone(),
            args,
            working_dir: self.settings.working_dir.clone(),
        })
    }

    fn classify(&self, attempt: u32, output: &ProcessOutput) -> LoadAttempt {
        let (classification, exit_code, message) = match output.status {
            ProcessStatus::Exited(code) => {
                let classification = self.settings.exit_codes.classify(code);
                let mut message = format!("exit code {}", code);
                let stderr = output.stderr.trim();
                if classification == ExitClassification::Fatal && !stderr.is_empty() {
                    message = format!("{}: {}", message, stderr.lines().last().unwrap_or(stderr));
                }
                (classification, Some(code), message)
            }
            ProcessStatus::Signaled => (ExitClassification::Fatal, None, "terminated by signal".to_string()),
            ProcessStatus::TimedOut => (ExitClassification::Timeout, None, "timed out".to_string()),
            ProcessStatus::Cancelled => (ExitClassification::Fatal, None, "cancelled".to_string()),
        };
        LoadAttempt {
            attempt,
            classification,
            exit_code,
            elapsed: output.elapsed,
            message,
        }
    }

    /// Write the control file and run the loader until it succeeds or retries run out
    pub async fn execute(
        &self,
        spec: &ControlSpecification,
        template: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LoadResult, LoaderError> {
        debug!(correlation_id = %spec.correlation_id, %template, ?timeout, "BulkLoadExecutor::execute: called");
        let control_file = self.renderer.write(template, spec).await?;
        let command = self.command_for(spec)?;
        let mut backoff = self.settings.retry.backoff();
        let mut attempts: Vec<LoadAttempt> = Vec::new();

        loop {
            let number = attempts.len() as u32 + 1;
            info!(correlation_id = %spec.correlation_id, attempt = number, "Running loader");
            let attempt = match self.runner.run(&command, timeout, cancel).await {
                Ok(output) if output.status == ProcessStatus::Cancelled => {
                    self.archiver.archive_failure(&spec.paths, &spec.correlation_id).await?;
                    return Err(LoaderError::Cancelled);
                }
                Ok(output) => self.classify(number, &output),
                Err(e) => LoadAttempt {
                    attempt: number,
                    classification: ExitClassification::Fatal,
                    exit_code: None,
                    elapsed: Duration::ZERO,
                    message: e.to_string(),
                },
            };
            let classification = attempt.classification;
            debug!(?attempt, "BulkLoadExecutor::execute: attempt finished");
            attempts.push(attempt);

            if matches!(
                classification,
                ExitClassification::Success | ExitClassification::PartialSuccessWithRejects
            ) {
                let statistics = self.parser.parse_file(&spec.paths.log_file).await;
                let archived = self.archiver.archive_success(&spec.paths, &spec.correlation_id).await?;
                info!(
                    correlation_id = %spec.correlation_id,
                    %classification,
                    loaded = statistics.rows_loaded,
                    rejected = statistics.records_rejected,
                    retries = backoff.retries(),
                    "Loader finished"
                );
                return Ok(LoadResult {
                    classification,
                    statistics,
                    retry_count: backoff.retries(),
                    attempts,
                    control_file,
                    archived,
                });
            }

            match backoff.next_step() {
                RetryStep::Retry { attempt, delay } => {
                    warn!(
                        correlation_id = %spec.correlation_id,
                        %classification,
                        retry = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Loader attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            self.archiver.archive_failure(&spec.paths, &spec.correlation_id).await?;
                            return Err(LoaderError::Cancelled);
                        }
                    }
                }
                RetryStep::Exhausted { retries } => {
                    warn!(correlation_id = %spec.correlation_id, retries, "Loader retries exhausted");
                    self.archiver.archive_failure(&spec.paths, &spec.correlation_id).await?;
                    return Err(match classification {
                        ExitClassification::Timeout => LoaderError::Timeout {
                            timeout,
                            retries,
                            attempts,
                        },
                        _ => LoaderError::Fatal {
                            message: attempts
                                .last()
                                .map(|a| a.message.clone())
                                .unwrap_or_else(|| "loader failed".to_string()),
                            retries,
                            attempts,
                        },
                    });
                }
            }
        }
    }
}
