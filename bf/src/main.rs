//! BulkFlow - bulk-load pipeline for delimited data files
//!
//! CLI entry point for running jobs and inspecting their configuration and
//! audit trail.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bulkflow::cli::{Cli, Command};
use bulkflow::config::Config;
use bulkflow::domain::{CorrelationId, JobState};
use bulkflow::events::{AuditSink, create_event_bus, read_execution_events, spawn_event_logger};
use bulkflow::loader::{ArtifactArchiver, ArtifactPaths, BulkLoadExecutor, ControlRenderer, ControlSpecification, SubprocessRunner};
use bulkflow::pipeline::{ExecutionReport, Orchestrator};
use bulkflow::providers::{FileConfigurationProvider, StaticReferenceData};
use bulkflow::source::discover_inputs;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bulkflow")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };
    let log_file = fs::File::create(log_dir.join("bulkflow.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Command::Run { job_id, inputs, json } => cmd_run(&config, &job_id, inputs, json).await,
        Command::RenderControl { job_id } => cmd_render_control(&config, &job_id).await,
        Command::Check { job_id } => cmd_check(&config, &job_id).await,
        Command::Events { correlation_id } => cmd_events(&config, &correlation_id),
    }
}

/// Wire providers, loader and event sink into an orchestrator
fn build_orchestrator(config: &Config, sink: Arc<dyn AuditSink>) -> Result<Orchestrator> {
    let mut configs = FileConfigurationProvider::new(&config.paths.job_dir);
    if let Some(fallback) = &config.paths.job_fallback_dir {
        configs = configs.with_fallback(fallback);
    }

    let reference = Arc::new(match &config.reference_data {
        Some(path) => StaticReferenceData::from_file(path)?,
        None => StaticReferenceData::default(),
    });

    let renderer = Arc::new(ControlRenderer::new(config.paths.template_dir.clone()));
    let runner = Arc::new(SubprocessRunner::new(config.loader.grace()));
    let archiver = ArtifactArchiver::new(&config.paths.archive_dir, &config.paths.error_dir);
    let executor = BulkLoadExecutor::new(config.loader.clone(), runner, renderer, archiver)
        .context("Failed to initialize bulk loader")?;

    Ok(Orchestrator::new(
        config.pipeline_settings(),
        Arc::new(configs),
        reference.clone(),
        reference,
        Arc::new(executor),
        sink,
    ))
}

/// Cancel the token on Ctrl-C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, cancelling"),
                _ = sigterm.recv() => info!("Received SIGTERM, cancelling"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, cancelling");
        }
        cancel.cancel();
    });
}

/// Run a job to a terminal state
async fn cmd_run(config: &Config, job_id: &str, inputs: Vec<PathBuf>, json: bool) -> Result<()> {
    debug!(%job_id, inputs = inputs.len(), "cmd_run: called");
    let bus = create_event_bus();
    let runs_dir = config.audit.runs_dir()?;
    let logger = spawn_event_logger(&bus, &runs_dir).context("Failed to start event logger")?;

    let orchestrator = build_orchestrator(config, bus.clone())?;
    let job = Arc::new(orchestrator.compile(job_id).await?);

    let inputs = if inputs.is_empty() {
        let found = discover_inputs(&config.paths.input_dir, &job.config.source.file_pattern)?;
        info!(count = found.len(), dir = %config.paths.input_dir.display(), "Discovered input files");
        found
    } else {
        inputs
    };
    if inputs.is_empty() {
        println!(
            "{} no input files matching '{}' in {}",
            "warning:".yellow().bold(),
            job.config.source.file_pattern,
            config.paths.input_dir.display()
        );
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let report = orchestrator.execute(job, &inputs, &cancel).await?;

    // Closing the bus lets the logger drain and flush
    drop(orchestrator);
    drop(bus);
    if let Err(e) = logger.await {
        warn!(error = %e, "Event logger task failed");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, &runs_dir);
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &ExecutionReport, runs_dir: &std::path::Path) {
    let execution = &report.execution;
    let status = match execution.status {
        JobState::Completed if execution.completed_with_rejects() => "COMPLETED WITH REJECTS".yellow().bold(),
        JobState::Completed => "COMPLETED".green().bold(),
        JobState::Aborted => "ABORTED".yellow().bold(),
        _ => "FAILED".red().bold(),
    };
    let stats = &execution.stats;

    println!("{} {}", "Job:".bright_cyan().bold(), execution.job_id);
    println!("{} {}", "Correlation ID:".bright_cyan().bold(), execution.correlation_id);
    println!("{} {}", "Status:".bright_cyan().bold(), status);
    println!();
    println!("  Records read:        {}", stats.records_read);
    println!("  Rejected (validate): {}", stats.validation_rejected);
    println!("  Written for load:    {}", stats.records_written);
    println!("  Loaded:              {}", stats.records_loaded);
    println!("  Rejected (loader):   {}", stats.records_rejected);
    println!("  Discarded:           {}", stats.records_discarded);
    println!("  Errors / warnings:   {} / {}", stats.errors, stats.warnings);
    if execution.threshold_retries > 0 {
        println!("  Threshold retries:   {}", execution.threshold_retries);
    }
    if execution.loader_retries > 0 {
        println!("  Loader retries:      {}", execution.loader_retries);
    }
    println!(
        "  Throughput:          {:.1} records/s",
        report.metrics.throughput()
    );

    if let Some(breach) = &execution.breach {
        println!();
        println!("{} {}", "Threshold:".yellow().bold(), breach);
    }
    if let Some(error) = &execution.last_error {
        println!("{} {}", "Error:".red().bold(), error);
    }
    if let Some(path) = &report.rejects_file {
        println!("{} {}", "Rejects:".bright_cyan(), path.display());
    }
    if let Some(path) = &execution.control_file {
        println!("{} {}", "Control file:".bright_cyan(), path.display());
    }
    println!(
        "{} {}",
        "Audit log:".bright_cyan(),
        runs_dir.join(execution.correlation_id.as_str()).join("events.jsonl").display()
    );
}

/// Print the control file a job would hand to the loader
async fn cmd_render_control(config: &Config, job_id: &str) -> Result<()> {
    debug!(%job_id, "cmd_render_control: called");
    let orchestrator = build_orchestrator(config, Arc::new(bulkflow::events::NullSink))?;
    let job = orchestrator.compile(job_id).await?;

    let correlation_id = CorrelationId::new(job_id);
    let paths = ArtifactPaths::in_dir(&orchestrator.settings().temp_dir, &correlation_id);
    let spec = ControlSpecification::build(&job.config, &job.mappings, &correlation_id, paths);
    let text = orchestrator
        .executor()
        .renderer()
        .render(&job.config.loader.template, &spec)?;
    print!("{}", text);
    Ok(())
}

/// Compile a job and summarize it
async fn cmd_check(config: &Config, job_id: &str) -> Result<()> {
    debug!(%job_id, "cmd_check: called");
    let orchestrator = build_orchestrator(config, Arc::new(bulkflow::events::NullSink))?;
    match orchestrator.compile(job_id).await {
        Ok(job) => {
            println!("{} {}", "OK".green().bold(), job.job_id());
            println!("  Target table:    {}", job.config.target.table);
            println!("  Mappings:        {}", job.mappings.len());
            println!(
                "  Validations:     {} pre, {} post",
                job.pre_rules.len(),
                job.post_rules.len()
            );
            println!("  Loader template: {}", job.config.loader.template);
            Ok(())
        }
        Err(e) => {
            println!("{} {}: {}", "INVALID".red().bold(), job_id, e);
            std::process::exit(1);
        }
    }
}

/// Replay an execution's audit log
fn cmd_events(config: &Config, correlation_id: &str) -> Result<()> {
    debug!(%correlation_id, "cmd_events: called");
    let runs_dir = config.audit.runs_dir()?;
    let entries = read_execution_events(&runs_dir, correlation_id)?;
    if entries.is_empty() {
        println!("No events recorded for {}", correlation_id);
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} {:<24} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
            entry.event.event_type().bright_cyan(),
            entry.event.summary()
        );
    }
    Ok(())
}
