//! Loader subprocess runner
//!
//! [`ProcessRunner`] is the seam between the executor's retry logic and the
//! operating system. [`SubprocessRunner`] runs the real loader with a
//! bounded timeout and terminates it on timeout or cancellation.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LoaderError;

/// A fully rendered loader invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    /// Killed by a signal it did not get from us
    Signaled,
    TimedOut,
    Cancelled,
}

/// Result of one subprocess run
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs one loader invocation to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        command: &LoaderCommand,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, LoaderError>;
}

enum Wait {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs the loader as a child process
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    grace: Duration,
}

impl SubprocessRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// SIGTERM, wait out the grace period, then kill
    async fn terminate(&self, child: &mut Child) {
        debug!(pid = ?child.id(), "SubprocessRunner::terminate: called");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = child.id()
                && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            {
                warn!(pid, error = %e, "Failed to send SIGTERM to loader");
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => debug!("SubprocessRunner::terminate: loader exited after SIGTERM"),
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "Loader ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill loader");
                }
            }
        }
    }
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Wait for a pipe reader, giving up after `limit`
///
/// Grandchildren can keep a pipe open after the loader itself is gone.
async fn collect(handle: JoinHandle<String>, limit: Duration) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(text)) => text,
        _ => {
            abort.abort();
            String::new()
        }
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(
        &self,
        command: &LoaderCommand,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, LoaderError> {
        debug!(program = %command.program, args = command.args.len(), ?timeout, "SubprocessRunner::run: called");
        let started = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        info!(pid = ?child.id(), program = %command.program, "Loader started");
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let wait = tokio::select! {
            status = child.wait() => Wait::Exited(status),
            _ = tokio::time::sleep(timeout) => Wait::TimedOut,
            _ = cancel.cancelled() => Wait::Cancelled,
        };

        let status = match wait {
            Wait::Exited(status) => match status?.code() {
                Some(code) => ProcessStatus::Exited(code),
                None => ProcessStatus::Signaled,
            },
            Wait::TimedOut => {
                warn!(timeout_secs = timeout.as_secs(), "Loader timed out");
                self.terminate(&mut child).await;
                ProcessStatus::TimedOut
            }
            Wait::Cancelled => {
                info!("Loader cancelled");
                self.terminate(&mut child).await;
                ProcessStatus::Cancelled
            }
        };

        let output = ProcessOutput {
            status,
            stdout: collect(stdout, self.grace).await,
            stderr: collect(stderr, self.grace).await,
            elapsed: started.elapsed(),
        };
        debug!(status = ?output.status, elapsed_ms = output.elapsed.as_millis() as u64, "SubprocessRunner::run: done");
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LoaderCommand {
        LoaderCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let runner = SubprocessRunner::default();
        let output = runner
            .run(&sh("echo loaded; echo oops >&2; exit 2"), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.status, ProcessStatus::Exited(2));
        assert_eq!(output.stdout.trim(), "loaded");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let runner = SubprocessRunner::new(Duration::from_millis(500));
        let output = runner
            .run(&sh("sleep 30"), Duration::from_millis(200), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.status, ProcessStatus::TimedOut);
        assert!(output.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kill_after_grace() {
        let runner = SubprocessRunner::new(Duration::from_millis(200));
        let output = runner
            .run(&sh("trap '' TERM; sleep 30"), Duration::from_millis(200), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.status, ProcessStatus::TimedOut);
        assert!(output.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let runner = SubprocessRunner::new(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let output = runner.run(&sh("sleep 30"), Duration::from_secs(30), &cancel).await.unwrap();
        assert_eq!(output.status, ProcessStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SubprocessRunner::default();
        let command = LoaderCommand {
            program: "/nonexistent/bulk-loader".to_string(),
            args: Vec::new(),
            working_dir: None,
        };
        let err = runner
            .run(&command, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Io(_)));
    }
}
