//! Command execution for Spark agents
//!
//! Every external action (docker, ray, nvidia-smi, ibdev2netdev, ssh) goes
//! through the [`CommandRunner`] seam:
//! - Explicit timeout on every command, the child is killed when it expires
//! - Failures are captured in the [`ExecutionResult`], never thrown
//! - Remote execution wraps a command in a non-interactive `ssh` login

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Exit code `ssh` uses for connection-level failures
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// A single command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// `bash -c <script>`
    pub fn shell(script: &str) -> Self {
        Self::new("bash", ["-c", script])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Shell-quoted rendering, used in logs and for remote execution
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }

    /// Run this command on `target` via a non-interactive ssh login
    pub fn over_ssh(&self, target: &SshTarget) -> CommandSpec {
        let connect_secs = target.connect_timeout.as_secs().max(1);
        let mut remote = String::new();
        for (key, value) in &self.env {
            remote.push_str(&format!("{}={} ", key, shell_words::quote(value)));
        }
        remote.push_str(&self.display());

        CommandSpec {
            program: "ssh".to_string(),
            args: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={}", connect_secs),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                target.destination(),
                remote,
            ],
            env: Vec::new(),
            // connection setup plus the command's own budget
            timeout: self.timeout + target.connect_timeout,
        }
    }
}

/// Remote host reachable through ssh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            user: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Why a command produced no exit status
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
pub enum ExecFailure {
    #[error("failed to spawn: {0}")]
    Spawn(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<ExecFailure>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    pub fn completed(command: &str, exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            failure: None,
            execution_time_ms: 0,
        }
    }

    pub fn failed(command: &str, failure: ExecFailure) -> Self {
        Self {
            command: command.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            failure: Some(failure),
            execution_time_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.exit_code == Some(0)
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(ExecFailure::TimedOut(_)))
    }

    /// True when an ssh-wrapped command never reached its host
    pub fn unreachable(&self) -> bool {
        self.failure.is_some() || self.exit_code == Some(SSH_CONNECTION_FAILURE)
    }

    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("STDERR:\n");
            out.push_str(self.stderr.trim_end());
        }
        if let Some(failure) = &self.failure {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&failure.to_string());
        }
        out
    }

    /// Last `lines` lines of combined output
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined_output();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Trimmed stdout on success, an error naming `what` otherwise
    pub fn into_stdout(self, what: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout.trim().to_string())
        } else {
            Err(anyhow!("{} failed ({}): {}", what, self.status_label(), self.tail(20)))
        }
    }

    pub fn status_label(&self) -> String {
        match (&self.failure, self.exit_code) {
            (Some(failure), _) => failure.to_string(),
            (None, Some(code)) => format!("exit {}", code),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

/// Seam for all process execution
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> ExecutionResult;
}

/// Runs commands on the local host
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> ExecutionResult {
        let start_time = Instant::now();
        let rendered = spec.display();
        debug!("Executing command: {} (timeout: {:?})", rendered, spec.timeout);

        let mut command = AsyncCommand::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut result = ExecutionResult::failed(&rendered, ExecFailure::Spawn(e.to_string()));
                result.execution_time_ms = start_time.elapsed().as_millis();
                return result;
            }
        };

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let mut result = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ExecutionResult {
                command: rendered,
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                failure: None,
                execution_time_ms: 0,
            },
            Ok(Err(e)) => ExecutionResult::failed(&rendered, ExecFailure::Spawn(e.to_string())),
            Err(_) => ExecutionResult::failed(&rendered, ExecFailure::TimedOut(spec.timeout)),
        };

        result.execution_time_ms = start_time.elapsed().as_millis();
        result
    }
}

/// Runs every command on a remote host through ssh
pub struct RemoteRunner {
    inner: Arc<dyn CommandRunner>,
    target: SshTarget,
}

impl RemoteRunner {
    pub fn new(inner: Arc<dyn CommandRunner>, target: SshTarget) -> Self {
        Self { inner, target }
    }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    async fn run(&self, spec: &CommandSpec) -> ExecutionResult {
        self.inner.run(&spec.over_ssh(&self.target)).await
    }
}

/// Check if a command exists in PATH
pub async fn command_exists(runner: &dyn CommandRunner, command: &str) -> bool {
    let spec = CommandSpec::new("which", [command]).with_timeout(Duration::from_secs(5));
    runner.run(&spec).await.success()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_command_execution() {
        let spec = CommandSpec::shell("echo 'Hello World'").with_timeout(Duration::from_secs(5));
        let result = SystemRunner.run(&spec).await;

        assert!(result.success());
        assert!(result.stdout.contains("Hello World"));
        assert!(result.execution_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let spec = CommandSpec::new("sleep", ["10"]).with_timeout(Duration::from_millis(200));
        let result = SystemRunner.run(&spec).await;

        assert!(!result.success());
        assert!(result.timed_out());
        assert!(result.execution_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_missing_program_is_captured() {
        let spec = CommandSpec::new("nonexistent_command_12345", Vec::<String>::new());
        let result = SystemRunner.run(&spec).await;

        assert!(!result.success());
        assert!(matches!(result.failure, Some(ExecFailure::Spawn(_))));
        assert!(result.into_stdout("probe").is_err());
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let spec = CommandSpec::shell("echo $SPARK_TEST_VALUE").with_env("SPARK_TEST_VALUE", "rdma");
        let result = SystemRunner.run(&spec).await;
        assert_eq!(result.into_stdout("echo").unwrap(), "rdma");
    }

    #[test]
    fn test_over_ssh_quotes_remote_command() {
        let spec = CommandSpec::new("docker", ["ps", "--format", "{{.Names}} {{.Status}}"])
            .with_timeout(Duration::from_secs(10));
        let target = SshTarget {
            host: "spark-b".to_string(),
            user: Some("nvidia".to_string()),
            connect_timeout: Duration::from_secs(5),
        };

        let remote = spec.over_ssh(&target);
        assert_eq!(remote.program, "ssh");
        assert!(remote.args.contains(&"BatchMode=yes".to_string()));
        assert!(remote.args.contains(&"nvidia@spark-b".to_string()));
        assert_eq!(
            remote.args.last().unwrap(),
            "docker ps --format '{{.Names}} {{.Status}}'"
        );
        assert_eq!(remote.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_tail_and_unreachable() {
        let result = ExecutionResult::completed("ssh x true", 255, "", "ssh: connect to host x port 22: No route to host");
        assert!(result.unreachable());
        assert!(result.tail(1).contains("No route to host"));
        assert_eq!(result.status_label(), "exit 255");
    }
}
