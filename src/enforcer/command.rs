//! External command execution with bounded retries
//!
//! The packet-filter backends never touch `std::process` directly. They
//! build a [`CommandSpec`] and hand it to a [`CommandExecutor`], which runs
//! it through a [`CommandRunner`] and applies the retry policy. Tests swap
//! the runner for a scripted one.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::EnforcementError;

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs one command to completion
///
/// `Err` is reserved for failures to run at all (missing binary, timeout);
/// a non-zero exit is an `Ok` output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, EnforcementError>;
}

/// Runs commands as child processes via `tokio::process`
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, EnforcementError> {
        trace!(command = %command, "Spawning");

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnforcementError::Spawn {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EnforcementError::Spawn {
                    program: command.program.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.timeout.as_millis() as u64;
                return Err(EnforcementError::Timeout {
                    command: command.to_string(),
                    timeout_ms,
                });
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// How often and how patiently a failed command is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Runner plus retry policy
#[derive(Clone)]
pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }

    /// Run a command that is expected to succeed
    ///
    /// Non-zero exits and timeouts are retried up to the policy limit. A
    /// spawn failure is returned immediately since retrying cannot help.
    pub async fn execute(&self, command: &CommandSpec) -> Result<CommandOutput, EnforcementError> {
        self.execute_accepting(command, |_| false).await
    }

    /// Like [`execute`](Self::execute), but a non-zero exit for which
    /// `accept` returns true is an answer and is returned without retrying
    ///
    /// Used for `-D` deletions, where exit 1 means the rule is absent, and
    /// for `conntrack -D`, which exits 1 when nothing matched.
    pub async fn execute_accepting<F>(
        &self,
        command: &CommandSpec,
        accept: F,
    ) -> Result<CommandOutput, EnforcementError>
    where
        F: Fn(&CommandOutput) -> bool + Send + Sync,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.runner.run(command).await {
                Ok(output) if output.is_success() => {
                    debug!(command = %command, attempt, "Command succeeded");
                    return Ok(output);
                }
                Ok(output) if accept(&output) => {
                    trace!(command = %command, attempt, status = ?output.status, "Command answered");
                    return Ok(output);
                }
                Ok(output) => {
                    warn!(
                        command = %command,
                        attempt,
                        status = ?output.status,
                        stderr = %output.stderr,
                        "Command failed"
                    );
                    last_error = Some(EnforcementError::command_failed(
                        command.to_string(),
                        output.status,
                        output.stderr,
                    ));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(command = %command, attempt, error = %e, "Command did not complete");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts && !self.retry.backoff.is_zero() {
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EnforcementError::command_failed(command.to_string(), None, "no attempts made")
        }))
    }

    /// Run a command once and report whether it exited zero
    ///
    /// Used for `-C` checks, where failure is an answer rather than an
    /// error.
    pub async fn probe(&self, command: &CommandSpec) -> bool {
        match self.runner.run(command).await {
            Ok(output) => {
                trace!(command = %command, status = ?output.status, "Probe finished");
                output.is_success()
            }
            Err(e) => {
                debug!(command = %command, error = %e, "Probe could not run");
                false
            }
        }
    }

}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::testing::ScriptedRunner;
    use super::*;

    fn executor(runner: Arc<ScriptedRunner>, max_attempts: u32) -> CommandExecutor {
        CommandExecutor::new(
            runner,
            RetryPolicy {
                max_attempts,
                backoff: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_command_display() {
        let cmd = CommandSpec::new("iptables").args(["-w", "-A", "FORWARD"]).arg("-j");
        assert_eq!(cmd.to_string(), "iptables -w -A FORWARD -j");
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let runner = Arc::new(ScriptedRunner::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(CommandOutput::failure(4, "resource busy"))
            } else {
                Ok(CommandOutput::success())
            }
        }));

        let result = executor(Arc::clone(&runner), 3)
            .execute(&CommandSpec::new("iptables"))
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_attempts() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::failure(1, "bad rule"))));
        let err = executor(Arc::clone(&runner), 2)
            .execute(&CommandSpec::new("iptables").arg("-A"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EnforcementError::CommandFailed { status: Some(1), .. }
        ));
        assert_eq!(runner.log().len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_not_retried() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            Err(EnforcementError::Spawn {
                program: cmd.program.clone(),
                reason: "No such file or directory".into(),
            })
        }));
        let err = executor(Arc::clone(&runner), 5)
            .execute(&CommandSpec::new("conntrack"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Spawn { .. }));
        assert_eq!(runner.log().len(), 1);
    }

    #[tokio::test]
    async fn test_accepted_exit_returned_without_retry() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::failure(1, "no such rule"))));
        let output = executor(Arc::clone(&runner), 3)
            .execute_accepting(&CommandSpec::new("iptables").arg("-D"), |o| o.status == Some(1))
            .await
            .unwrap();
        assert_eq!(output.status, Some(1));
        assert_eq!(runner.log().len(), 1);
    }

    #[tokio::test]
    async fn test_unaccepted_exit_still_retried() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::failure(4, "lock held"))));
        let err = executor(Arc::clone(&runner), 3)
            .execute_accepting(&CommandSpec::new("iptables").arg("-D"), |o| o.status == Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::CommandFailed { status: Some(4), .. }));
        assert_eq!(runner.log().len(), 3);
    }

    #[tokio::test]
    async fn test_probe_runs_once() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::failure(1, ""))));
        assert!(!executor(Arc::clone(&runner), 3).probe(&CommandSpec::new("iptables")).await);
        assert_eq!(runner.log().len(), 1);
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_status() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let ok = runner.run(&CommandSpec::new("true")).await.unwrap();
        assert!(ok.is_success());

        let failed = runner.run(&CommandSpec::new("false")).await.unwrap();
        assert_eq!(failed.status, Some(1));
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CommandSpec::new("/nonexistent/captive-portal-tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemCommandRunner::new(Duration::from_millis(50));
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Timeout { timeout_ms: 50, .. }));
    }
}
