//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// BulkFlow - validate, transform and bulk-load delimited data files
#[derive(Parser)]
#[command(
    name = "bf",
    about = "Validate, transform and bulk-load delimited data files",
    version,
    after_help = "Logs are written to: ~/.local/share/bulkflow/logs/bulkflow.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a job over its input files
    Run {
        /// Job identifier (the job configuration file stem)
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Input file; repeatable. When omitted, files matching the job's
        /// file pattern are discovered in the input directory.
        #[arg(short, long = "input", value_name = "FILE")]
        inputs: Vec<PathBuf>,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a job's control file to stdout without running the loader
    RenderControl {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Compile a job configuration and report problems
    Check {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },

    /// Replay the audit log of an execution
    Events {
        #[arg(value_name = "CORRELATION_ID")]
        correlation_id: String,
    },
}
