//! Staged node bring-up
//!
//! A bring-up run executes a fixed, ordered list of [`ProvisioningStep`]s for
//! one role, then a terminal health check. The node only becomes
//! [`NodeStatus::Ready`] once every step completed and that check passed;
//! step completion alone never implies readiness.
//!
//! Failed runs leave containers and processes in place for inspection.
//! Teardown is the separate [`teardown`] operation.

mod steps;
mod teardown;

pub use steps::{coordinator_plan, worker_plan};
pub use teardown::{teardown, TeardownReport};

use crate::capabilities::NodeCapabilities;
use crate::config::{ClusterConfig, Role};
use crate::discovery::{default_node_address, NetworkDetector, NetworkSelection};
use crate::docker::Docker;
use crate::error::{BringupError, ConfigError};
use crate::execution::{CommandRunner, ExecutionResult};
use crate::health::{ClusterHealthPoller, HealthCheck, PollOutcome, Probe};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle of a node handle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running { step: usize },
    /// Every step done, but the advisory terminal check never passed
    Unconfirmed,
    Ready,
    Failed { step: usize },
}

/// The runtime process container created by a bring-up run
#[derive(Debug, Clone, Serialize)]
pub struct NodeHandle {
    pub role: Role,
    pub container: String,
    pub container_id: Option<String>,
    pub address: String,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
}

impl NodeHandle {
    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }
}

/// Observable state of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Pending,
    Running(usize),
    Verifying,
    Ready,
    Unconfirmed,
    Failed(usize),
    HealthCheckFailed,
    Cancelled(usize),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "PENDING"),
            RunState::Running(step) => write!(f, "RUNNING({})", step),
            RunState::Verifying => write!(f, "VERIFYING"),
            RunState::Ready => write!(f, "READY"),
            RunState::Unconfirmed => write!(f, "UNCONFIRMED"),
            RunState::Failed(step) => write!(f, "FAILED({})", step),
            RunState::HealthCheckFailed => write!(f, "FAILED(health check)"),
            RunState::Cancelled(step) => write!(f, "CANCELLED({})", step),
        }
    }
}

/// Everything a step may read or update while the run is in progress
pub struct BringupContext {
    pub role: Role,
    pub config: ClusterConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub docker: Docker,
    pub poller: ClusterHealthPoller,
    pub http: reqwest::Client,
    pub network: NetworkSelection,
    pub node_address: String,
    pub container: String,
    pub handle: Option<NodeHandle>,
    pub ray_version: Option<String>,
}

impl BringupContext {
    pub fn new(
        role: Role,
        config: ClusterConfig,
        runner: Arc<dyn CommandRunner>,
        network: NetworkSelection,
        node_address: String,
        cancel: CancellationToken,
    ) -> Result<Self, BringupError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeouts.http)
            .build()
            .map_err(|e| ConfigError::invalid("timeouts.http", format!("{:?}", config.timeouts.http), e))?;

        Ok(Self {
            docker: Docker::new(runner.clone(), config.timeouts.command),
            poller: ClusterHealthPoller::new(cancel),
            container: config.container_name(role),
            role,
            config,
            runner,
            http,
            network,
            node_address,
            handle: None,
            ray_version: None,
        })
    }

    /// Poll check on the configured interval
    pub fn check(&self, name: &str, attempts: u32) -> HealthCheck {
        HealthCheck::new(name, self.config.polling.interval, attempts)
    }

    /// Upper bound for a step that polls `attempts` times
    pub fn poll_budget(&self, attempts: u32) -> Duration {
        (self.config.polling.interval + self.config.timeouts.command) * attempts.max(1)
    }

    /// Environment passed to every process in the container
    pub fn container_env(&self) -> Vec<(String, String)> {
        let mut env = self.network.nccl_env();
        env.push(("VLLM_HOST_IP".to_string(), self.node_address.clone()));
        if let Some(token) = &self.config.serve.hf_token {
            env.push(("HF_TOKEN".to_string(), token.clone()));
        }
        env
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done,
    /// Nothing to do; the step's effect was already in place
    AlreadySatisfied,
}

#[derive(Debug, Clone)]
pub enum StepFailure {
    Failed { reason: String, diagnostics: String },
    Cancelled,
}

impl StepFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        StepFailure::Failed {
            reason: reason.into(),
            diagnostics: String::new(),
        }
    }

    /// Failure carrying the tail of a command's output
    pub fn from_result(reason: impl Into<String>, result: &ExecutionResult) -> Self {
        StepFailure::Failed {
            reason: format!("{} ({})", reason.into(), result.status_label()),
            diagnostics: result.tail(20),
        }
    }

    /// Map a non-satisfied poll outcome
    pub fn from_poll(what: &str, outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Cancelled { .. } => StepFailure::Cancelled,
            PollOutcome::TimedOut {
                attempts,
                last_observation,
            } => StepFailure::Failed {
                reason: format!("{} not observed after {} attempts", what, attempts),
                diagnostics: last_observation,
            },
            PollOutcome::Satisfied { .. } => StepFailure::new(format!("{} unexpectedly satisfied", what)),
        }
    }
}

impl From<anyhow::Error> for StepFailure {
    fn from(e: anyhow::Error) -> Self {
        StepFailure::new(format!("{:#}", e))
    }
}

#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure>;
}

pub struct ProvisioningStep {
    pub ordinal: usize,
    pub description: String,
    pub timeout: Duration,
    /// A failure is logged and the run continues
    pub tolerate_failure: bool,
    /// Next command for an operator when this step fails
    pub hint: String,
    pub action: Box<dyn StepAction>,
}

pub struct TerminalCheck {
    pub check: HealthCheck,
    pub probe: Box<dyn Probe>,
    /// A timeout fails the run; otherwise the node ends up unconfirmed
    pub required: bool,
    pub hint: String,
}

pub struct BringupPlan {
    pub role: Role,
    pub steps: Vec<ProvisioningStep>,
    pub terminal: TerminalCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    AlreadySatisfied,
    Tolerated(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub ordinal: usize,
    pub description: String,
    pub status: StepStatus,
    pub duration: Duration,
}

pub struct NodeBringupSequencer {
    cancel: CancellationToken,
    state: RunState,
    records: Vec<StepRecord>,
}

impl NodeBringupSequencer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            state: RunState::Pending,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    fn transition(&mut self, state: RunState) {
        info!("bring-up state: {} -> {}", self.state, state);
        self.state = state;
    }

    fn record(&mut self, step: &ProvisioningStep, status: StepStatus, started: Instant) {
        self.records.push(StepRecord {
            ordinal: step.ordinal,
            description: step.description.clone(),
            status,
            duration: started.elapsed(),
        });
    }

    /// Execute `plan` strictly in order. No step is retried; a fatal failure
    /// ends the run and leaves everything it started running.
    pub async fn run(&mut self, plan: BringupPlan, ctx: &mut BringupContext) -> Result<NodeHandle, BringupError> {
        let total = plan.steps.len();

        for step in &plan.steps {
            // Abort stops new steps; in-flight commands are never interrupted
            if self.cancel.is_cancelled() {
                self.transition(RunState::Cancelled(step.ordinal));
                return Err(BringupError::Cancelled {
                    next_ordinal: step.ordinal,
                });
            }

            self.transition(RunState::Running(step.ordinal));
            if let Some(handle) = ctx.handle.as_mut() {
                handle.status = NodeStatus::Running { step: step.ordinal };
            }
            info!(step = step.ordinal, "[{}/{}] {}", step.ordinal, total, step.description);
            let started = Instant::now();

            let result = match tokio::time::timeout(step.timeout, step.action.execute(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepFailure::new(format!("timed out after {:?}", step.timeout))),
            };

            match result {
                Ok(StepOutcome::Done) => {
                    info!("✅ {} ({:.1?})", step.description, started.elapsed());
                    self.record(step, StepStatus::Done, started);
                }
                Ok(StepOutcome::AlreadySatisfied) => {
                    info!("✅ {} (already satisfied)", step.description);
                    self.record(step, StepStatus::AlreadySatisfied, started);
                }
                Err(StepFailure::Cancelled) => {
                    self.record(step, StepStatus::Cancelled, started);
                    self.transition(RunState::Cancelled(step.ordinal));
                    return Err(BringupError::Cancelled {
                        next_ordinal: step.ordinal,
                    });
                }
                Err(StepFailure::Failed { reason, diagnostics }) if step.tolerate_failure => {
                    warn!("⚠️ {} failed, continuing: {}", step.description, reason);
                    if !diagnostics.is_empty() {
                        warn!("{}", diagnostics);
                    }
                    self.record(step, StepStatus::Tolerated(reason), started);
                }
                Err(StepFailure::Failed { reason, diagnostics }) => {
                    error!("❌ step {} ({}) failed: {}", step.ordinal, step.description, reason);
                    self.record(step, StepStatus::Failed(reason.clone()), started);
                    self.transition(RunState::Failed(step.ordinal));
                    if let Some(handle) = ctx.handle.as_mut() {
                        handle.status = NodeStatus::Failed { step: step.ordinal };
                    }
                    return Err(BringupError::Step {
                        ordinal: step.ordinal,
                        description: step.description.clone(),
                        reason,
                        diagnostics,
                        hint: step.hint.clone(),
                    });
                }
            }
        }

        let mut handle = ctx.handle.take().unwrap_or_else(|| NodeHandle {
            role: ctx.role,
            container: ctx.container.clone(),
            container_id: None,
            address: ctx.node_address.clone(),
            capabilities: NodeCapabilities::default(),
            status: NodeStatus::Pending,
        });

        self.transition(RunState::Verifying);
        let terminal = &plan.terminal;
        let outcome = ctx.poller.wait_for(terminal.probe.as_ref(), &terminal.check).await;

        match outcome {
            PollOutcome::Satisfied { attempts, detail } => {
                info!("✅ {} after {} attempt(s): {}", terminal.check.name, attempts, detail);
                handle.status = NodeStatus::Ready;
                self.transition(RunState::Ready);
                Ok(handle)
            }
            PollOutcome::Cancelled { .. } => {
                self.transition(RunState::Cancelled(total + 1));
                Err(BringupError::Cancelled { next_ordinal: total + 1 })
            }
            PollOutcome::TimedOut {
                attempts,
                last_observation,
            } if !terminal.required => {
                warn!(
                    "⚠️ {} not confirmed after {} attempts ({}); continuing as allowed by configuration",
                    terminal.check.name, attempts, last_observation
                );
                handle.status = NodeStatus::Unconfirmed;
                self.transition(RunState::Unconfirmed);
                Ok(handle)
            }
            PollOutcome::TimedOut {
                attempts,
                last_observation,
            } => {
                error!("❌ {} not satisfied after {} attempts", terminal.check.name, attempts);
                self.transition(RunState::HealthCheckFailed);
                Err(BringupError::HealthCheck {
                    check: terminal.check.name.clone(),
                    attempts,
                    last_observation,
                    hint: terminal.hint.clone(),
                })
            }
        }
    }
}

/// Outcome of [`bring_up`] with the per-step report
pub struct BringupRun {
    pub result: Result<NodeHandle, BringupError>,
    pub records: Vec<StepRecord>,
    pub state: RunState,
}

/// Validate, detect the fabric, then run the role's plan
pub async fn bring_up(
    role: Role,
    config: ClusterConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
) -> BringupRun {
    let not_started = |err: BringupError| BringupRun {
        result: Err(err),
        records: Vec::new(),
        state: RunState::Pending,
    };

    // Nothing may run before the configuration is known to be usable
    if let Err(e) = config.validate_for(role) {
        error!("❌ {}", e);
        return not_started(e.into());
    }

    let interfaces = NetworkDetector::new(runner.clone()).detect().await;
    let network = NetworkSelection::resolve(&interfaces, &config.network, config.configured_address(role));
    let node_address = match network.address.clone() {
        Some(address) => address,
        None => {
            let var = match role {
                Role::Coordinator => "HEAD_IP",
                Role::Worker => "WORKER_IP",
            };
            let address = default_node_address(&network.interface).to_string();
            warn!(
                "⚠️ No address on {} and {} not set, using {}",
                network.interface, var, address
            );
            address
        }
    };
    info!(
        "Using {} ({}, {}) at {}",
        network.interface,
        network.hca,
        network.speed_label(),
        node_address
    );

    let mut ctx = match BringupContext::new(role, config, runner, network, node_address, cancel.clone()) {
        Ok(ctx) => ctx,
        Err(e) => return not_started(e),
    };
    let plan = match role {
        Role::Coordinator => coordinator_plan(&ctx),
        Role::Worker => worker_plan(&ctx),
    };

    let mut sequencer = NodeBringupSequencer::new(cancel);
    let result = sequencer.run(plan, &mut ctx).await;
    BringupRun {
        result,
        state: sequencer.state(),
        records: sequencer.records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::ScriptedRunner;
    use crate::health::Observation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Result<StepOutcome, StepFailure>, Arc<AtomicUsize>);

    #[async_trait]
    impl StepAction for Fixed {
        async fn execute(&self, _ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone()
        }
    }

    struct Constant(bool);

    #[async_trait]
    impl Probe for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        async fn observe(&self) -> Observation {
            Observation {
                healthy: self.0,
                detail: format!("healthy={}", self.0),
            }
        }
    }

    fn context() -> BringupContext {
        let mut config = ClusterConfig::default();
        config.polling.interval = Duration::from_millis(1);
        let network = NetworkSelection::resolve(&[], &config.network, Some("127.0.0.1"));
        BringupContext::new(
            Role::Coordinator,
            config,
            Arc::new(ScriptedRunner::new()),
            network,
            "127.0.0.1".to_string(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn step(ordinal: usize, result: Result<StepOutcome, StepFailure>, tolerate: bool, calls: &Arc<AtomicUsize>) -> ProvisioningStep {
        ProvisioningStep {
            ordinal,
            description: format!("step {}", ordinal),
            timeout: Duration::from_secs(5),
            tolerate_failure: tolerate,
            hint: format!("inspect step {}", ordinal),
            action: Box::new(Fixed(result, calls.clone())),
        }
    }

    fn plan(steps: Vec<ProvisioningStep>, healthy: bool, required: bool) -> BringupPlan {
        BringupPlan {
            role: Role::Coordinator,
            steps,
            terminal: TerminalCheck {
                check: HealthCheck::new("terminal", Duration::from_millis(1), 3),
                probe: Box::new(Constant(healthy)),
                required,
                hint: "check the server log".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_ready_requires_terminal_check() {
        let calls = Arc::new(AtomicUsize::new(0));
        let steps = vec![
            step(1, Ok(StepOutcome::Done), false, &calls),
            step(2, Ok(StepOutcome::AlreadySatisfied), false, &calls),
        ];

        let mut sequencer = NodeBringupSequencer::new(CancellationToken::new());
        let handle = sequencer.run(plan(steps, true, true), &mut context()).await.unwrap();
        assert!(handle.is_ready());
        assert_eq!(sequencer.state(), RunState::Ready);
        assert_eq!(sequencer.records().len(), 2);

        let steps = vec![step(1, Ok(StepOutcome::Done), false, &calls)];
        let mut sequencer = NodeBringupSequencer::new(CancellationToken::new());
        let err = sequencer.run(plan(steps, false, true), &mut context()).await.unwrap_err();
        assert!(matches!(err, BringupError::HealthCheck { attempts: 3, .. }));
        assert_eq!(sequencer.state(), RunState::HealthCheckFailed);
    }

    #[tokio::test]
    async fn test_advisory_terminal_check_is_never_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let steps = vec![step(1, Ok(StepOutcome::Done), false, &calls)];

        let mut sequencer = NodeBringupSequencer::new(CancellationToken::new());
        let handle = sequencer.run(plan(steps, false, false), &mut context()).await.unwrap();
        assert_eq!(handle.status, NodeStatus::Unconfirmed);
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn test_fatal_step_stops_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let steps = vec![
            step(1, Ok(StepOutcome::Done), false, &calls),
            step(2, Err(StepFailure::new("boom")), false, &calls),
            step(3, Ok(StepOutcome::Done), false, &calls),
        ];

        let mut sequencer = NodeBringupSequencer::new(CancellationToken::new());
        let err = sequencer.run(plan(steps, true, true), &mut context()).await.unwrap_err();

        assert!(matches!(err, BringupError::Step { ordinal: 2, ref reason, .. } if reason == "boom"));
        assert_eq!(err.hint(), "inspect step 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sequencer.state(), RunState::Failed(2));
    }

    #[tokio::test]
    async fn test_tolerated_failure_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let steps = vec![
            step(1, Err(StepFailure::new("model cached elsewhere")), true, &calls),
            step(2, Ok(StepOutcome::Done), false, &calls),
        ];

        let mut sequencer = NodeBringupSequencer::new(CancellationToken::new());
        let handle = sequencer.run(plan(steps, true, true), &mut context()).await.unwrap();
        assert!(handle.is_ready());
        assert!(matches!(sequencer.records()[0].status, StepStatus::Tolerated(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let steps = vec![step(1, Ok(StepOutcome::Done), false, &calls)];

        let mut sequencer = NodeBringupSequencer::new(cancel);
        let err = sequencer.run(plan(steps, true, true), &mut context()).await.unwrap_err();
        assert!(matches!(err, BringupError::Cancelled { next_ordinal: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_without_head_ip_runs_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        let run = bring_up(Role::Worker, ClusterConfig::default(), runner.clone(), CancellationToken::new()).await;

        assert!(matches!(run.result, Err(BringupError::Config(ConfigError::Missing { var: "HEAD_IP", .. }))));
        assert!(run.records.is_empty());
        assert!(runner.calls().is_empty());
    }
}
