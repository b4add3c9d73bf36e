//! Provisioning steps and the per-role plans built from them

use super::{
    BringupContext, BringupPlan, NodeHandle, NodeStatus, ProvisioningStep, StepAction, StepFailure, StepOutcome,
    TerminalCheck,
};
use crate::capabilities::CapabilityDetector;
use crate::config::Role;
use crate::docker::ContainerSpec;
use crate::health::{
    pgrep_pattern, AllOf, ContainerRunningProbe, HttpHealthProbe, ProcessAliveProbe, Probe, RayMembershipProbe,
    TcpReachableProbe,
};
use crate::inference::{self, SERVER_LOG, SERVER_PROCESS_PATTERN};
use crate::ray;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Container-side mount point of the model cache
const CONTAINER_HF_CACHE: &str = "/root/.cache/huggingface";
/// Attempts when confirming a freshly started process or container
const STARTUP_ATTEMPTS: u32 = 10;

struct PullImage;

#[async_trait]
impl StepAction for PullImage {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let image = ctx.config.container.image.clone();
        if ctx.config.container.skip_pull {
            return if ctx.docker.image_present(&image).await {
                Ok(StepOutcome::AlreadySatisfied)
            } else {
                Err(StepFailure::new(format!("pull skipped but {} is not present locally", image)))
            };
        }

        let result = ctx.docker.pull(&image, ctx.config.timeouts.pull).await;
        if result.success() {
            return Ok(StepOutcome::Done);
        }

        // Registry trouble is fine as long as a local copy exists
        if ctx.docker.image_present(&image).await {
            warn!("⚠️ docker pull failed ({}), using local copy of {}", result.status_label(), image);
            return Ok(StepOutcome::AlreadySatisfied);
        }
        Err(StepFailure::from_result(format!("failed to pull {}", image), &result))
    }
}

struct RemoveStaleContainer;

#[async_trait]
impl StepAction for RemoveStaleContainer {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let name = ctx.container.clone();
        if ctx.docker.count_named(&name).await == 0 {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        info!("Removing stale container {}", name);
        let result = ctx.docker.remove(&name).await;
        let remaining = ctx.docker.count_named(&name).await;
        if remaining > 0 {
            return Err(StepFailure::from_result(
                format!("container {} still present after removal", name),
                &result,
            ));
        }
        Ok(StepOutcome::Done)
    }
}

struct LaunchContainer;

#[async_trait]
impl StepAction for LaunchContainer {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let mut spec = ContainerSpec::new(&ctx.container, &ctx.config.container.image);
        spec.shm_size = ctx.config.container.shm_size.clone();
        spec.env = ctx.container_env();
        spec.rdma = !ctx.network.fallback;
        spec.volumes.push((
            ctx.config.container.hf_cache.to_string_lossy().to_string(),
            CONTAINER_HF_CACHE.to_string(),
        ));

        let result = ctx.docker.run_detached(&spec).await;
        if !result.success() {
            return Err(StepFailure::from_result(format!("docker run {} failed", ctx.container), &result));
        }
        let container_id = result.stdout.trim().to_string();
        debug!("Started container {} ({})", ctx.container, container_id);

        let probe = ContainerRunningProbe::new(ctx.docker.clone(), &ctx.container);
        let check = ctx.check("container running", STARTUP_ATTEMPTS);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            return Err(StepFailure::from_poll("running container", outcome));
        }

        let capabilities = CapabilityDetector::new(ctx.runner.as_ref())
            .node_capabilities(!ctx.network.fallback)
            .await;
        info!(
            "Node {} declares {} GPU(s), RDMA {}",
            capabilities.hostname,
            capabilities.gpu_count,
            if capabilities.rdma { "on" } else { "fallback" }
        );

        ctx.handle = Some(NodeHandle {
            role: ctx.role,
            container: ctx.container.clone(),
            container_id: (!container_id.is_empty()).then_some(container_id),
            address: ctx.node_address.clone(),
            capabilities,
            status: NodeStatus::Pending,
        });
        Ok(StepOutcome::Done)
    }
}

/// `ray --version` inside the container, if Ray is installed
async fn installed_ray_version(ctx: &BringupContext) -> (Option<String>, String) {
    let result = ctx
        .docker
        .exec(&ctx.container, ray::version_script(), &[], ctx.config.timeouts.command)
        .await;
    let output = result.combined_output();
    let version = if result.success() {
        ray::parse_version(&result.stdout)
    } else {
        None
    };
    (version, output)
}

struct InstallRay;

#[async_trait]
impl StepAction for InstallRay {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let wanted = ctx.config.ray.version.clone();
        if let (Some(current), _) = installed_ray_version(ctx).await {
            if current == wanted {
                return Ok(StepOutcome::AlreadySatisfied);
            }
            info!("Replacing Ray {} with {}", current, wanted);
        }

        let result = ctx
            .docker
            .exec(&ctx.container, &ray::install_script(&wanted), &[], ctx.config.timeouts.install)
            .await;
        if !result.success() {
            return Err(StepFailure::from_result(format!("pip install ray=={} failed", wanted), &result));
        }
        Ok(StepOutcome::Done)
    }
}

/// Where the expected Ray version comes from
#[derive(Debug, Clone, Copy, PartialEq)]
enum VersionSource {
    Configured,
    /// The coordinator's dashboard, falling back to the configured version
    Coordinator,
}

struct VerifyRayVersion {
    source: VersionSource,
}

#[async_trait]
impl StepAction for VerifyRayVersion {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let expected = match (self.source, ctx.config.node.head_ip.as_deref()) {
            (VersionSource::Coordinator, Some(head_ip)) => {
                match ray::coordinator_version(&ctx.http, head_ip, ctx.config.ray.dashboard_port).await {
                    Ok(version) => {
                        info!("Coordinator runs Ray {}", version);
                        version
                    }
                    Err(e) => {
                        warn!(
                            "⚠️ could not read coordinator Ray version ({:#}), expecting configured {}",
                            e, ctx.config.ray.version
                        );
                        ctx.config.ray.version.clone()
                    }
                }
            }
            _ => ctx.config.ray.version.clone(),
        };

        let (installed, output) = installed_ray_version(ctx).await;
        match installed {
            Some(installed) if installed == expected => {
                info!("Ray version {} confirmed", installed);
                ctx.ray_version = Some(installed);
                Ok(StepOutcome::Done)
            }
            // Mixed versions hang or corrupt the cluster protocol, never just warn
            Some(installed) => Err(StepFailure::Failed {
                reason: format!("installed Ray {} does not match required {}", installed, expected),
                diagnostics: output,
            }),
            None => Err(StepFailure::Failed {
                reason: "could not determine installed Ray version".to_string(),
                diagnostics: output,
            }),
        }
    }
}

struct StartRayHead;

#[async_trait]
impl StepAction for StartRayHead {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let timeout = ctx.config.timeouts.command;
        let stop = ctx.docker.exec(&ctx.container, ray::stop_script(), &[], timeout).await;
        debug!("ray stop: {}", stop.status_label());

        let script = ray::head_start_script(&ctx.node_address, ctx.config.ray.port, ctx.config.ray.dashboard_port);
        let env = ctx.container_env();
        let result = ctx.docker.exec(&ctx.container, &script, &env, timeout).await;
        if !result.success() {
            return Err(StepFailure::from_result("ray start --head failed", &result));
        }

        let probe = RayMembershipProbe::new(ctx.docker.clone(), &ctx.container, 1, timeout);
        let check = ctx.check("ray head alive", ctx.config.polling.ray_start_attempts);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            return Err(StepFailure::from_poll("ray head liveness", outcome));
        }
        Ok(StepOutcome::Done)
    }
}

struct WaitForWorkers;

#[async_trait]
impl StepAction for WaitForWorkers {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let expected = ctx.config.node.expected_nodes as usize;
        info!("Waiting for {} Ray node(s); start the workers now", expected);

        let probe = RayMembershipProbe::new(ctx.docker.clone(), &ctx.container, expected, ctx.config.timeouts.command);
        let check = ctx.check("worker membership", ctx.config.polling.worker_join_attempts);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            return Err(StepFailure::from_poll(&format!("{} active Ray nodes", expected), outcome));
        }
        Ok(StepOutcome::Done)
    }
}

struct DownloadModel;

#[async_trait]
impl StepAction for DownloadModel {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        if ctx.config.serve.skip_download {
            return Ok(StepOutcome::AlreadySatisfied);
        }

        let script = inference::download_script(&ctx.config.serve.model);
        let env = ctx.container_env();
        let result = ctx
            .docker
            .exec(&ctx.container, &script, &env, ctx.config.timeouts.download)
            .await;
        if !result.success() {
            return Err(StepFailure::from_result(
                format!("download of {} failed", ctx.config.serve.model),
                &result,
            ));
        }
        Ok(StepOutcome::Done)
    }
}

struct StartServer;

#[async_trait]
impl StepAction for StartServer {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let timeout = ctx.config.timeouts.command;

        // One server per host; a leftover would hold the port and GPU memory
        let kill = format!("pkill -f {}", shell_words::quote(&pgrep_pattern(SERVER_PROCESS_PATTERN)));
        let killed = ctx.docker.exec(&ctx.container, &kill, &[], timeout).await;
        match killed.exit_code {
            Some(0) => info!("Stopped a previous vllm serve in {}", ctx.container),
            Some(1) => debug!("No previous vllm serve in {}", ctx.container),
            _ => warn!(
                "⚠️ Could not stop a previous vllm serve in {} ({}); the new server may fail to bind",
                ctx.container,
                killed.status_label()
            ),
        }

        let env = ctx.container_env();
        let script = inference::serve_script(&ctx.config.serve);
        let result = ctx.docker.exec_detached(&ctx.container, &script, &env).await;
        if !result.success() {
            return Err(StepFailure::from_result("failed to launch vllm serve", &result));
        }

        let probe = ProcessAliveProbe::new(ctx.docker.clone(), &ctx.container, SERVER_PROCESS_PATTERN, timeout);
        let check = ctx.check("server process alive", STARTUP_ATTEMPTS);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            let log = ctx
                .docker
                .exec(&ctx.container, &format!("tail -n 40 {}", SERVER_LOG), &[], timeout)
                .await;
            return Err(StepFailure::Failed {
                reason: "vllm serve exited right after launch".to_string(),
                diagnostics: log.combined_output(),
            });
        }
        Ok(StepOutcome::Done)
    }
}

fn head_ip(ctx: &BringupContext) -> Result<String, StepFailure> {
    ctx.config
        .node
        .head_ip
        .clone()
        .ok_or_else(|| StepFailure::new("HEAD_IP is not set"))
}

fn reachability_probe(ctx: &BringupContext, head_ip: &str) -> TcpReachableProbe {
    TcpReachableProbe::new(head_ip, ctx.config.ray.port, Duration::from_secs(3))
}

struct ConfirmCoordinatorReachable;

#[async_trait]
impl StepAction for ConfirmCoordinatorReachable {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let head_ip = head_ip(ctx)?;
        let probe = reachability_probe(ctx, &head_ip);
        let check = ctx.check("coordinator reachable", ctx.config.polling.reachability_attempts);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            return Err(StepFailure::from_poll(
                &format!("coordinator at {}:{}", head_ip, ctx.config.ray.port),
                outcome,
            ));
        }
        Ok(StepOutcome::Done)
    }
}

struct JoinCluster;

#[async_trait]
impl StepAction for JoinCluster {
    async fn execute(&self, ctx: &mut BringupContext) -> Result<StepOutcome, StepFailure> {
        let head_ip = head_ip(ctx)?;
        let timeout = ctx.config.timeouts.command;

        // The coordinator may have gone away since step 1
        let observation = reachability_probe(ctx, &head_ip).observe().await;
        if !observation.healthy {
            return Err(StepFailure::Failed {
                reason: "coordinator no longer reachable".to_string(),
                diagnostics: observation.detail,
            });
        }

        let stop = ctx.docker.exec(&ctx.container, ray::stop_script(), &[], timeout).await;
        debug!("ray stop: {}", stop.status_label());

        let script = ray::worker_start_script(&head_ip, ctx.config.ray.port, &ctx.node_address);
        let env = ctx.container_env();
        let result = ctx.docker.exec(&ctx.container, &script, &env, timeout).await;
        if !result.success() {
            return Err(StepFailure::from_result(format!("ray start --address={} failed", head_ip), &result));
        }

        let probe = RayMembershipProbe::new(ctx.docker.clone(), &ctx.container, 1, timeout);
        let check = ctx.check("ray worker alive", ctx.config.polling.ray_start_attempts);
        let outcome = ctx.poller.wait_for(&probe, &check).await;
        if !outcome.is_satisfied() {
            return Err(StepFailure::from_poll("ray worker liveness", outcome));
        }
        Ok(StepOutcome::Done)
    }
}

struct StepBuilder {
    steps: Vec<ProvisioningStep>,
}

impl StepBuilder {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn add(
        &mut self,
        description: &str,
        timeout: Duration,
        tolerate_failure: bool,
        hint: String,
        action: impl StepAction + 'static,
    ) -> &mut Self {
        self.steps.push(ProvisioningStep {
            ordinal: self.steps.len() + 1,
            description: description.to_string(),
            timeout,
            tolerate_failure,
            hint,
            action: Box::new(action),
        });
        self
    }

    /// Steps 2-4 of a worker, 1-3 of the coordinator
    fn container_steps(&mut self, ctx: &BringupContext) -> &mut Self {
        let image = &ctx.config.container.image;
        let name = &ctx.container;
        let timeouts = &ctx.config.timeouts;
        let launch_budget = timeouts.command * 2 + ctx.poll_budget(STARTUP_ATTEMPTS);

        self.add(
            "Pull container image",
            timeouts.pull + timeouts.command,
            false,
            format!("docker pull {}", image),
            PullImage,
        )
        .add(
            "Remove stale container",
            timeouts.command * 3,
            false,
            format!("docker ps -a --filter name={}", name),
            RemoveStaleContainer,
        )
        .add(
            "Launch container",
            launch_budget,
            false,
            format!("docker logs {}", name),
            LaunchContainer,
        )
        .add(
            &format!("Install Ray {}", ctx.config.ray.version),
            timeouts.install + timeouts.command,
            false,
            format!("docker exec {} pip show ray", name),
            InstallRay,
        )
    }
}

fn ray_hint(ctx: &BringupContext) -> String {
    format!("docker exec {} ray status", ctx.container)
}

pub fn coordinator_plan(ctx: &BringupContext) -> BringupPlan {
    let polling = &ctx.config.polling;
    let timeouts = &ctx.config.timeouts;
    let server_log_hint = format!("docker exec {} tail -n 100 {}", ctx.container, SERVER_LOG);

    let mut builder = StepBuilder::new();
    builder
        .container_steps(ctx)
        .add(
            "Verify Ray version",
            timeouts.command * 2,
            false,
            format!("docker exec {} ray --version", ctx.container),
            VerifyRayVersion {
                source: VersionSource::Configured,
            },
        )
        .add(
            "Start Ray head",
            timeouts.command * 2 + ctx.poll_budget(polling.ray_start_attempts),
            false,
            ray_hint(ctx),
            StartRayHead,
        )
        .add(
            "Wait for workers",
            ctx.poll_budget(polling.worker_join_attempts),
            ctx.config.node.allow_partial_cluster,
            "spark-agent diagnose --full --remote <worker host>".to_string(),
            WaitForWorkers,
        )
        .add(
            &format!("Download {}", ctx.config.serve.model),
            timeouts.download + timeouts.command,
            // a cached model or a transient hub error must not abort the run
            true,
            format!("docker exec {} huggingface-cli scan-cache", ctx.container),
            DownloadModel,
        )
        .add(
            "Start inference server",
            timeouts.command * 3 + ctx.poll_budget(STARTUP_ATTEMPTS),
            false,
            server_log_hint.clone(),
            StartServer,
        );

    let health_url = format!("http://{}:{}/health", ctx.node_address, ctx.config.serve.port);
    let probes: Vec<Box<dyn Probe>> = vec![
        Box::new(ProcessAliveProbe::new(
            ctx.docker.clone(),
            &ctx.container,
            SERVER_PROCESS_PATTERN,
            timeouts.command,
        )),
        Box::new(HttpHealthProbe::new(&health_url, timeouts.http)),
    ];

    BringupPlan {
        role: Role::Coordinator,
        steps: builder.steps,
        terminal: TerminalCheck {
            check: ctx.check("inference server /health", polling.server_ready_attempts),
            probe: Box::new(AllOf::new("server ready", probes)),
            required: true,
            hint: server_log_hint,
        },
    }
}

pub fn worker_plan(ctx: &BringupContext) -> BringupPlan {
    let polling = &ctx.config.polling;
    let timeouts = &ctx.config.timeouts;
    let head = ctx.config.node.head_ip.clone().unwrap_or_default();
    let reach_hint = format!("nc -zv {} {}", head, ctx.config.ray.port);

    let mut builder = StepBuilder::new();
    builder.add(
        "Confirm coordinator reachable",
        ctx.poll_budget(polling.reachability_attempts),
        false,
        reach_hint.clone(),
        ConfirmCoordinatorReachable,
    );
    builder
        .container_steps(ctx)
        .add(
            "Verify Ray version matches coordinator",
            timeouts.http + timeouts.command * 2,
            false,
            format!("curl http://{}:{}/api/version", head, ctx.config.ray.dashboard_port),
            VerifyRayVersion {
                source: VersionSource::Coordinator,
            },
        )
        .add(
            "Join Ray cluster",
            timeouts.command * 3 + ctx.poll_budget(polling.ray_start_attempts),
            false,
            reach_hint,
            JoinCluster,
        );

    BringupPlan {
        role: Role::Worker,
        steps: builder.steps,
        terminal: TerminalCheck {
            check: ctx.check("cluster membership", polling.worker_join_attempts),
            probe: Box::new(RayMembershipProbe::new(
                ctx.docker.clone(),
                &ctx.container,
                ctx.config.node.expected_nodes as usize,
                timeouts.command,
            )),
            required: !ctx.config.node.allow_partial_cluster,
            hint: ray_hint(ctx),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::discovery::NetworkSelection;
    use crate::execution::testing::ScriptedRunner;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(role: Role, config: ClusterConfig, runner: ScriptedRunner) -> BringupContext {
        let network = NetworkSelection::resolve(&[], &config.network, Some("10.0.0.2"));
        BringupContext::new(
            role,
            config,
            Arc::new(runner),
            network,
            "10.0.0.2".to_string(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn descriptions(plan: &BringupPlan) -> Vec<(usize, String)> {
        plan.steps.iter().map(|s| (s.ordinal, s.description.clone())).collect()
    }

    #[test]
    fn test_coordinator_plan_order() {
        let ctx = context(Role::Coordinator, ClusterConfig::default(), ScriptedRunner::new());
        let plan = coordinator_plan(&ctx);
        let steps = descriptions(&plan);

        assert_eq!(steps.len(), 9);
        assert_eq!(steps[0], (1, "Pull container image".to_string()));
        assert_eq!(steps[4].1, "Verify Ray version");
        assert_eq!(steps[8].1, "Start inference server");
        assert!(plan.terminal.required);
        // download is the only tolerable step by default
        let tolerated: Vec<usize> = plan.steps.iter().filter(|s| s.tolerate_failure).map(|s| s.ordinal).collect();
        assert_eq!(tolerated, vec![8]);
    }

    #[test]
    fn test_partial_cluster_policy() {
        let mut config = ClusterConfig::default();
        config.node.allow_partial_cluster = true;
        config.node.head_ip = Some("10.0.0.1".to_string());

        let coordinator = coordinator_plan(&context(Role::Coordinator, config.clone(), ScriptedRunner::new()));
        assert!(coordinator.steps[6].tolerate_failure);

        let worker = worker_plan(&context(Role::Worker, config, ScriptedRunner::new()));
        assert!(!worker.terminal.required);
    }

    #[test]
    fn test_worker_plan_verifies_before_join() {
        let mut config = ClusterConfig::default();
        config.node.head_ip = Some("10.0.0.1".to_string());
        let plan = worker_plan(&context(Role::Worker, config, ScriptedRunner::new()));
        let steps = descriptions(&plan);

        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0].1, "Confirm coordinator reachable");
        assert_eq!(steps[5].1, "Verify Ray version matches coordinator");
        assert_eq!(steps[6].1, "Join Ray cluster");
        assert!(plan.terminal.required);
    }

    #[tokio::test]
    async fn test_install_skipped_when_version_matches() {
        let runner = ScriptedRunner::new().on("ray --version", 0, "ray, version 2.51.0\n");
        let mut ctx = context(Role::Coordinator, ClusterConfig::default(), runner);

        let outcome = InstallRay.execute(&mut ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::AlreadySatisfied);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let runner = ScriptedRunner::new().on("ray --version", 0, "ray, version 2.50.0\n");
        let mut ctx = context(Role::Coordinator, ClusterConfig::default(), runner);

        let failure = VerifyRayVersion {
            source: VersionSource::Configured,
        }
        .execute(&mut ctx)
        .await
        .unwrap_err();
        match failure {
            StepFailure::Failed { reason, .. } => {
                assert!(reason.contains("2.50.0"));
                assert!(reason.contains("2.51.0"));
            }
            StepFailure::Cancelled => panic!("unexpected cancel"),
        }
        assert!(ctx.ray_version.is_none());
    }

    #[tokio::test]
    async fn test_pull_failure_tolerated_with_local_image() {
        let runner = ScriptedRunner::new()
            .on("docker pull", 1, "")
            .on("docker image inspect", 0, "[]");
        let mut ctx = context(Role::Coordinator, ClusterConfig::default(), runner);

        assert_eq!(PullImage.execute(&mut ctx).await.unwrap(), StepOutcome::AlreadySatisfied);
    }

    #[tokio::test]
    async fn test_start_server_continues_when_stale_kill_fails() {
        let runner = ScriptedRunner::new()
            .on("pkill", 126, "")
            .on("docker exec -d", 0, "")
            .on("pgrep", 0, "4242\n");
        let mut ctx = context(Role::Coordinator, ClusterConfig::default(), runner);

        assert_eq!(StartServer.execute(&mut ctx).await.unwrap(), StepOutcome::Done);
    }

    #[tokio::test]
    async fn test_remove_stale_skips_when_absent() {
        let runner = ScriptedRunner::new().on("docker ps -a", 0, "");
        let mut ctx = context(Role::Coordinator, ClusterConfig::default(), runner);

        assert_eq!(
            RemoveStaleContainer.execute(&mut ctx).await.unwrap(),
            StepOutcome::AlreadySatisfied
        );
    }
}
