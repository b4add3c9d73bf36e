//! Bounded health polling
//!
//! A [`Probe`] makes one side-effect-free observation; [`ClusterHealthPoller`]
//! repeats it on a fixed interval until it holds, the attempt budget runs out,
//! or the operator aborts. Running out of attempts is an outcome, not an
//! error: callers decide whether a timeout is fatal.

use crate::docker::{ContainerState, Docker};
use crate::ray;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of a single probe evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub healthy: bool,
    pub detail: String,
}

impl Observation {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;
    async fn observe(&self) -> Observation;
}

/// Poll descriptor: what to wait for and how long
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl HealthCheck {
    pub fn new(name: &str, interval: Duration, max_attempts: u32) -> Self {
        Self {
            name: name.to_string(),
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Satisfied { attempts: u32, detail: String },
    TimedOut { attempts: u32, last_observation: String },
    Cancelled { attempts: u32 },
}

impl PollOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { attempts, .. }
            | PollOutcome::TimedOut { attempts, .. }
            | PollOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

#[derive(Clone, Default)]
pub struct ClusterHealthPoller {
    cancel: CancellationToken,
}

impl ClusterHealthPoller {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Observe `probe` at most `check.max_attempts` times, sleeping
    /// `check.interval` between attempts only
    pub async fn wait_for(&self, probe: &dyn Probe, check: &HealthCheck) -> PollOutcome {
        let max_attempts = check.max_attempts.max(1);
        let mut last_observation = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return PollOutcome::Cancelled { attempts: attempt - 1 };
            }

            let observation = probe.observe().await;
            debug!(
                check = %check.name,
                attempt,
                max_attempts,
                healthy = observation.healthy,
                "{}",
                observation.detail
            );

            if observation.healthy {
                info!("✅ {} satisfied after {} attempt(s)", check.name, attempt);
                return PollOutcome::Satisfied {
                    attempts: attempt,
                    detail: observation.detail,
                };
            }
            last_observation = observation.detail;

            if attempt < max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return PollOutcome::Cancelled { attempts: attempt };
                    }
                    _ = tokio::time::sleep(check.interval) => {}
                }
            }
        }

        PollOutcome::TimedOut {
            attempts: max_attempts,
            last_observation,
        }
    }
}

/// Every member observed in the same tick; healthy only if all are
pub struct AllOf {
    name: String,
    probes: Vec<Box<dyn Probe>>,
}

impl AllOf {
    pub fn new(name: &str, probes: Vec<Box<dyn Probe>>) -> Self {
        Self {
            name: name.to_string(),
            probes,
        }
    }
}

#[async_trait]
impl Probe for AllOf {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe(&self) -> Observation {
        let mut healthy = true;
        let mut details = Vec::with_capacity(self.probes.len());

        for probe in &self.probes {
            let observation = probe.observe().await;
            healthy &= observation.healthy;
            details.push(format!("{}: {}", probe.name(), observation.detail));
        }

        Observation {
            healthy,
            detail: details.join("; "),
        }
    }
}

/// `GET <url>` answers 200
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Probe for HttpHealthProbe {
    fn name(&self) -> &str {
        "http-health"
    }

    async fn observe(&self) -> Observation {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().as_u16() == 200 => Observation::healthy(format!("{} -> 200", self.url)),
            Ok(response) => Observation::unhealthy(format!("{} -> {}", self.url, response.status())),
            Err(e) => Observation::unhealthy(format!("{} unreachable: {}", self.url, e)),
        }
    }
}

/// A TCP connection to `address` succeeds
pub struct TcpReachableProbe {
    address: String,
    connect_timeout: Duration,
}

impl TcpReachableProbe {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpReachableProbe {
    fn name(&self) -> &str {
        "tcp-reachable"
    }

    async fn observe(&self) -> Observation {
        match tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Observation::healthy(format!("{} accepting connections", self.address)),
            Ok(Err(e)) => Observation::unhealthy(format!("{}: {}", self.address, e)),
            Err(_) => Observation::unhealthy(format!("{}: connect timed out", self.address)),
        }
    }
}

pub struct ContainerRunningProbe {
    docker: Docker,
    container: String,
}

impl ContainerRunningProbe {
    pub fn new(docker: Docker, container: &str) -> Self {
        Self {
            docker,
            container: container.to_string(),
        }
    }
}

#[async_trait]
impl Probe for ContainerRunningProbe {
    fn name(&self) -> &str {
        "container-running"
    }

    async fn observe(&self) -> Observation {
        match self.docker.state(&self.container).await {
            ContainerState::Running => Observation::healthy(format!("{} running", self.container)),
            ContainerState::Stopped(status) => Observation::unhealthy(format!("{} is {}", self.container, status)),
            ContainerState::Missing => Observation::unhealthy(format!("{} does not exist", self.container)),
            ContainerState::Unknown(reason) => {
                Observation::unhealthy(format!("{} state unknown: {}", self.container, reason))
            }
        }
    }
}

/// `pgrep -f` pattern that cannot match the shell running pgrep itself
pub fn pgrep_pattern(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) => format!("[{}]{}", first, chars.as_str()),
        None => String::new(),
    }
}

/// A process matching `pattern` is alive inside the container
pub struct ProcessAliveProbe {
    docker: Docker,
    container: String,
    pattern: String,
    timeout: Duration,
}

impl ProcessAliveProbe {
    pub fn new(docker: Docker, container: &str, pattern: &str, timeout: Duration) -> Self {
        Self {
            docker,
            container: container.to_string(),
            pattern: pattern.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for ProcessAliveProbe {
    fn name(&self) -> &str {
        "process-alive"
    }

    async fn observe(&self) -> Observation {
        let script = format!("pgrep -f {}", shell_words::quote(&pgrep_pattern(&self.pattern)));
        let result = self.docker.exec(&self.container, &script, &[], self.timeout).await;
        if result.success() && !result.stdout.trim().is_empty() {
            let pids: Vec<&str> = result.stdout.split_whitespace().collect();
            Observation::healthy(format!("'{}' alive (pid {})", self.pattern, pids.join(",")))
        } else {
            Observation::unhealthy(format!("no process matching '{}' ({})", self.pattern, result.status_label()))
        }
    }
}

/// `ray status` inside the container lists at least `min_nodes` active nodes
pub struct RayMembershipProbe {
    docker: Docker,
    container: String,
    min_nodes: usize,
    timeout: Duration,
}

impl RayMembershipProbe {
    pub fn new(docker: Docker, container: &str, min_nodes: usize, timeout: Duration) -> Self {
        Self {
            docker,
            container: container.to_string(),
            min_nodes,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for RayMembershipProbe {
    fn name(&self) -> &str {
        "ray-membership"
    }

    async fn observe(&self) -> Observation {
        let result = self
            .docker
            .exec(&self.container, ray::status_script(), &[], self.timeout)
            .await;
        if !result.success() {
            return Observation::unhealthy(format!("ray status failed: {}", result.tail(3)));
        }

        let status = ray::parse_ray_status(&result.stdout);
        let detail = format!(
            "{}/{} active nodes ({} pending, {} recent failures)",
            status.active_nodes.len(),
            self.min_nodes,
            status.pending_nodes_count,
            status.recent_failures_count
        );
        Observation {
            healthy: status.active_nodes.len() >= self.min_nodes,
            detail,
        }
    }
}
