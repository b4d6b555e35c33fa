//! System Command Runner
//!
//! Runs external tools through `tokio::process` with discrete argument
//! vectors. No shell is involved anywhere. Device-busy failures are retried
//! with exponential backoff before the error is surfaced.

use crate::domain::ports::{
    split_lines, CommandOutput, CommandRequest, CommandRunner, SupervisedProcess,
};
use crate::error::{Error, Result};
use crate::executor::process::ChildProcess;
use crate::metrics::metrics;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Runner Configuration
// =============================================================================

/// Retry and capture settings for the system runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Total attempts for transient failures (1 disables retry)
    pub retry_attempts: u32,
    /// First backoff interval in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Stderr lines kept from supervised processes
    pub stderr_tail_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            stderr_tail_lines: 20,
        }
    }
}

// =============================================================================
// System Command Runner
// =============================================================================

/// Command runner backed by real OS processes
pub struct SystemCommandRunner {
    config: RunnerConfig,
}

impl SystemCommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    async fn run_once(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| Error::Validation("empty command".into()))?;

        debug!(argv = ?request.argv, "running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .env("LC_ALL", "C")
            .stdin(if request.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        if let (Some(input), Some(mut stdin)) = (request.input.clone(), child.stdin.take()) {
            // Written concurrently so a chatty process cannot deadlock on a full pipe
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        let wait = child.wait_with_output();
        let output = match request.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(output) => output?,
                Err(_) => {
                    metrics()
                        .commands
                        .with_label_values(&[request.program(), "timeout"])
                        .inc();
                    return Err(Error::CommandTimeout {
                        argv: request.argv.clone(),
                        timeout,
                    });
                }
            },
            None => wait.await?,
        };

        let return_code = output.status.code().unwrap_or(-1);
        let captured = CommandOutput {
            stdout: split_lines(&String::from_utf8_lossy(&output.stdout)),
            stderr: split_lines(&String::from_utf8_lossy(&output.stderr)),
            return_code,
        };

        check_output(request, captured)
    }
}

/// Turn an unacceptable return code into a `CommandExecution` error
pub fn check_output(request: &CommandRequest, output: CommandOutput) -> Result<CommandOutput> {
    if request.acceptable_codes.contains(&output.return_code) {
        metrics()
            .commands
            .with_label_values(&[request.program(), "ok"])
            .inc();
        Ok(output)
    } else {
        metrics()
            .commands
            .with_label_values(&[request.program(), "failed"])
            .inc();
        Err(Error::CommandExecution {
            argv: request.argv.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            return_code: output.return_code,
        })
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        if !request.retry_transient || self.config.retry_attempts <= 1 {
            return self.run_once(&request).await;
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let request = &request;
        let max_attempts = self.config.retry_attempts;

        backoff::future::retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match self.run_once(request).await {
                Ok(output) => Ok(output),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        argv = ?request.argv,
                        attempt,
                        "transient command failure, retrying: {}",
                        e
                    );
                    metrics()
                        .commands
                        .with_label_values(&[request.program(), "retried"])
                        .inc();
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn spawn(&self, argv: Vec<String>) -> Result<Box<dyn SupervisedProcess>> {
        let process = ChildProcess::spawn(argv, self.config.stderr_tail_lines)?;
        Ok(Box::new(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn runner() -> SystemCommandRunner {
        SystemCommandRunner::new(RunnerConfig {
            retry_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            stderr_tail_lines: 5,
        })
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = runner()
            .run(CommandRequest::new(["echo", "hello", "world"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, vec!["hello world".to_string()]);
        assert_eq!(output.return_code, 0);
    }

    #[tokio::test]
    async fn test_arguments_are_not_interpreted_by_a_shell() {
        let output = runner()
            .run(CommandRequest::new(["echo", "$(id); rm -rf /tmp/x"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, vec!["$(id); rm -rf /tmp/x".to_string()]);
    }

    #[tokio::test]
    async fn test_input_is_piped_to_stdin() {
        let output = runner()
            .run(CommandRequest::new(["cat"]).with_input("line one\nline two\n"))
            .await
            .unwrap();
        assert_eq!(output.stdout, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn test_unacceptable_code_is_an_error() {
        let err = runner()
            .run(CommandRequest::new(["false"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandExecution { return_code: 1, .. });

        let output = runner()
            .run(CommandRequest::new(["false"]).accept(&[1]))
            .await
            .unwrap();
        assert_eq!(output.return_code, 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = runner()
            .run(CommandRequest::new(["sleep", "5"]).with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandTimeout { .. });
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let script = format!(
            "echo x >> {}; echo 'ERROR: Device or resource busy' >&2; exit 1",
            counter.display()
        );

        let err = runner()
            .run(CommandRequest::new(["sh", "-c", script.as_str()]))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let attempts = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(attempts.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let script = format!(
            "echo x >> {}; echo 'ERROR: not a btrfs filesystem' >&2; exit 1",
            counter.display()
        );

        let err = runner()
            .run(CommandRequest::new(["sh", "-c", script.as_str()]))
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let attempts = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(attempts.lines().count(), 1);
    }
}
