//! Docker CLI wrapper
//!
//! Thin layer over the `docker` binary: every call goes through a
//! [`CommandRunner`] with an explicit timeout.

use crate::execution::{CommandRunner, CommandSpec, ExecutionResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Observed container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Missing,
    Running,
    /// Exists but not running; carries docker's status string
    Stopped(String),
    /// `docker inspect` failed for another reason (daemon down, permissions)
    Unknown(String),
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Missing => write!(f, "absent"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped(status) => write!(f, "{}", status),
            ContainerState::Unknown(reason) => write!(f, "unknown ({})", reason),
        }
    }
}

/// Everything needed for `docker run`
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<(String, String)>,
    pub shm_size: String,
    pub gpus: bool,
    pub host_network: bool,
    /// Pass `/dev/infiniband` through; off on hosts without RDMA
    pub rdma: bool,
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            env: Vec::new(),
            volumes: Vec::new(),
            shm_size: "16g".to_string(),
            gpus: true,
            host_network: true,
            rdma: true,
            // keep the container alive; work happens through `docker exec`
            command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }

    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if self.gpus {
            args.extend(["--gpus".to_string(), "all".to_string()]);
        }
        if self.host_network {
            args.extend([
                "--network".to_string(),
                "host".to_string(),
                "--ipc".to_string(),
                "host".to_string(),
            ]);
        }
        args.extend(["--shm-size".to_string(), self.shm_size.clone()]);
        args.extend([
            "--ulimit".to_string(),
            "memlock=-1".to_string(),
            "--ulimit".to_string(),
            "stack=67108864".to_string(),
        ]);
        if self.rdma {
            args.extend(["--device".to_string(), "/dev/infiniband".to_string()]);
        }
        for (key, value) in &self.env {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        for (host, container) in &self.volumes {
            args.extend(["-v".to_string(), format!("{}:{}", host, container)]);
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[derive(Clone)]
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Docker {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn docker<I, S>(&self, args: I, timeout: Duration) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("docker", args).with_timeout(timeout);
        debug!("docker: {}", spec.display());
        self.runner.run(&spec).await
    }

    pub async fn pull(&self, image: &str, timeout: Duration) -> ExecutionResult {
        self.docker(["pull", image], timeout).await
    }

    pub async fn image_present(&self, image: &str) -> bool {
        self.docker(["image", "inspect", image], self.timeout).await.success()
    }

    pub async fn state(&self, name: &str) -> ContainerState {
        let result = self
            .docker(["inspect", "--format", "{{.State.Status}}", name], self.timeout)
            .await;

        if !result.success() {
            let output = result.combined_output();
            if output.contains("No such object") || output.contains("No such container") {
                return ContainerState::Missing;
            }
            return ContainerState::Unknown(format!("{}: {}", result.status_label(), result.tail(1)));
        }

        match result.stdout.trim() {
            "running" => ContainerState::Running,
            other => ContainerState::Stopped(other.to_string()),
        }
    }

    /// Number of containers (any state) carrying exactly this name
    pub async fn count_named(&self, name: &str) -> usize {
        let filter = format!("name=^/{}$", name);
        let result = self
            .docker(["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"], self.timeout)
            .await;

        result
            .stdout
            .lines()
            .filter(|line| line.trim() == name)
            .count()
    }

    pub async fn remove(&self, name: &str) -> ExecutionResult {
        self.docker(["rm", "-f", name], self.timeout).await
    }

    /// `docker run -d`; stdout carries the new container id
    pub async fn run_detached(&self, spec: &ContainerSpec) -> ExecutionResult {
        self.docker(spec.run_args(), self.timeout).await
    }

    /// `docker exec <name> bash -lc <script>`
    pub async fn exec(&self, name: &str, script: &str, env: &[(String, String)], timeout: Duration) -> ExecutionResult {
        self.docker(exec_args(name, script, env, false), timeout).await
    }

    /// `docker exec -d`: starts `script` and returns immediately
    pub async fn exec_detached(&self, name: &str, script: &str, env: &[(String, String)]) -> ExecutionResult {
        self.docker(exec_args(name, script, env, true), self.timeout).await
    }

    pub async fn logs_tail(&self, name: &str, lines: usize) -> ExecutionResult {
        let lines = lines.to_string();
        self.docker(["logs", "--tail", lines.as_str(), name], self.timeout).await
    }
}

fn exec_args(name: &str, script: &str, env: &[(String, String)], detached: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if detached {
        args.push("-d".to_string());
    }
    for (key, value) in env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }
    args.extend([
        name.to_string(),
        "bash".to_string(),
        "-lc".to_string(),
        script.to_string(),
    ]);
    args
}
