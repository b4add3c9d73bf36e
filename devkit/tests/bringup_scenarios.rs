use spark_agent::bringup::{teardown, RunState, StepStatus};
use spark_agent::config::Role;
use spark_agent::error::{BringupError, ConfigError};
use spark_agent::NodeStatus;
use spark_devkit::{FakeHost, FakeServerOptions, TestHarness};
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn coordinator_reaches_ready() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();

    let run = harness.up(Role::Coordinator).await;
    let handle = run.result.expect("coordinator bring-up");

    assert_eq!(run.state, RunState::Ready);
    assert_eq!(handle.status, NodeStatus::Ready);
    assert_eq!(handle.container, "ray-head");
    assert_eq!(handle.address, "127.0.0.1");
    assert_eq!(handle.capabilities.gpu_count, 1);
    assert_eq!(run.records.len(), 9);
    assert!(run.records.iter().all(|r| !matches!(r.status, StepStatus::Failed(_))));

    assert!(harness.host.server_running_in("ray-head"));
    assert_eq!(harness.host.ray_version_in("ray-head").as_deref(), Some("2.51.0"));
    assert!(harness.host.ran("ray start --head"));
    assert!(harness.host.ran("--distributed-executor-backend ray"));
    assert!(harness.host.ran("--device /dev/infiniband"));
    assert!(harness.host.ran("NCCL_IB_HCA=rocep1s0f1"));
}

#[tokio::test]
async fn coordinator_without_rdma_uses_fallback_defaults() {
    let mut harness = TestHarness::new(FakeHost::new().with_rdma(None)).await.unwrap();
    harness.config.node.head_ip = None;

    let run = harness.up(Role::Coordinator).await;
    let handle = run.result.expect("bring-up on the fallback interface");

    assert_eq!(run.state, RunState::Ready);
    assert!(handle.address.parse::<Ipv4Addr>().is_ok(), "{}", handle.address);
    assert!(harness.host.ran("ibdev2netdev"));
    assert!(harness.host.ran("NCCL_IB_HCA=mlx5_1"));
    assert!(harness.host.ran("NCCL_SOCKET_IFNAME=enp1s0f1np1"));
    assert!(!harness.host.ran("/dev/infiniband"));
}

#[tokio::test]
async fn worker_without_rdma_tooling_still_joins() {
    let mut harness = TestHarness::new(FakeHost::new().without_tool("ibdev2netdev")).await.unwrap();
    harness.config.node.worker_ip = None;

    let run = harness.up(Role::Worker).await;

    assert_eq!(run.state, RunState::Ready);
    assert!(run.result.unwrap().address.parse::<Ipv4Addr>().is_ok());
    assert!(harness.host.ran("ray start --address=127.0.0.1"));
    assert!(!harness.host.ran("/dev/infiniband"));
}

#[tokio::test]
async fn coordinator_reports_every_gpu() {
    let harness = TestHarness::new(FakeHost::new().with_gpus(&["NVIDIA GB10", "NVIDIA GB10"]))
        .await
        .unwrap();

    let handle = harness.up(Role::Coordinator).await.result.unwrap();
    assert_eq!(handle.capabilities.gpu_count, 2);
}

#[tokio::test]
async fn second_run_leaves_exactly_one_container() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();

    let first = harness.up(Role::Coordinator).await;
    assert!(first.result.is_ok());
    let second = harness.up(Role::Coordinator).await;
    assert_eq!(second.state, RunState::Ready);

    assert_eq!(harness.host.container_names(), vec!["ray-head".to_string()]);
    assert_eq!(harness.host.count("docker rm -f ray-head"), 1);
    assert!(matches!(second.records[1].status, StepStatus::Done));
}

#[tokio::test]
async fn unhealthy_server_is_never_ready() {
    let harness = TestHarness::with_server(
        FakeHost::new(),
        FakeServerOptions {
            healthy: false,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let run = harness.up(Role::Coordinator).await;

    assert_eq!(run.state, RunState::HealthCheckFailed);
    match run.result {
        Err(BringupError::HealthCheck { attempts, .. }) => {
            assert_eq!(attempts, harness.config.polling.server_ready_attempts)
        }
        other => panic!("expected health check failure, got {:?}", other.map(|h| h.status)),
    }
}

#[tokio::test]
async fn crashing_server_fails_with_log_tail() {
    let host = FakeHost::new()
        .server_crashes()
        .with_server_log("Traceback (most recent call last):\ntorch.OutOfMemoryError: CUDA out of memory\n");
    let harness = TestHarness::new(host).await.unwrap();

    let run = harness.up(Role::Coordinator).await;

    assert_eq!(run.state, RunState::Failed(9));
    let err = run.result.unwrap_err();
    assert!(err.diagnostics().unwrap_or_default().contains("CUDA out of memory"));
    assert!(err.hint().contains("/tmp/vllm_serve.log"));
}

#[tokio::test]
async fn worker_with_mismatched_ray_fails_before_join() {
    let mut harness = TestHarness::with_server(
        FakeHost::new(),
        FakeServerOptions {
            ray_version: "2.51.0".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    harness.config.ray.version = "2.50.0".to_string();

    let run = harness.up(Role::Worker).await;

    assert_eq!(run.state, RunState::Failed(6));
    match run.result {
        Err(BringupError::Step { ordinal, reason, .. }) => {
            assert_eq!(ordinal, 6);
            assert!(reason.contains("2.50.0"));
            assert!(reason.contains("2.51.0"));
        }
        other => panic!("expected step 6 failure, got {:?}", other.map(|h| h.status)),
    }
    assert!(!harness.host.ran("ray start --address"));
}

#[tokio::test]
async fn worker_joins_and_confirms_membership() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();

    let run = harness.up(Role::Worker).await;

    assert_eq!(run.state, RunState::Ready);
    assert_eq!(run.records.len(), 7);
    assert!(harness.host.ran(&format!("ray start --address=127.0.0.1:{}", harness.server.port())));
}

#[tokio::test]
async fn worker_is_ready_only_once_ray_lists_it() {
    let harness = TestHarness::new(FakeHost::new().with_ray_nodes(1)).await.unwrap();

    let lonely = harness.up(Role::Worker).await;
    assert_eq!(lonely.state, RunState::HealthCheckFailed);
    assert!(matches!(lonely.result, Err(BringupError::HealthCheck { .. })));

    // The coordinator now sees both nodes
    harness.host.set_ray_nodes(2);
    let joined = harness.up(Role::Worker).await;
    assert_eq!(joined.state, RunState::Ready);
    assert!(joined.result.unwrap().is_ready());
}

#[tokio::test]
async fn worker_without_coordinator_address_runs_nothing() {
    let mut harness = TestHarness::new(FakeHost::new()).await.unwrap();
    harness.config.node.head_ip = None;

    let run = harness.up(Role::Worker).await;

    assert!(matches!(
        run.result,
        Err(BringupError::Config(ConfigError::Missing { var: "HEAD_IP", .. }))
    ));
    assert_eq!(run.state, RunState::Pending);
    assert!(harness.host.history().is_empty());
}

#[tokio::test]
async fn partial_cluster_is_unconfirmed_not_ready() {
    let mut harness = TestHarness::new(FakeHost::new().with_ray_nodes(1)).await.unwrap();
    harness.config.node.allow_partial_cluster = true;

    let run = harness.up(Role::Worker).await;

    assert_eq!(run.state, RunState::Unconfirmed);
    let handle = run.result.unwrap();
    assert_eq!(handle.status, NodeStatus::Unconfirmed);
    assert!(!handle.is_ready());
}

#[tokio::test]
async fn abort_before_start_runs_no_step() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let run = harness.up_with(Role::Coordinator, harness.config.clone(), cancel).await;

    assert_eq!(run.state, RunState::Cancelled(1));
    assert!(!harness.host.ran("docker pull"));
}

#[tokio::test]
async fn teardown_after_bring_up() {
    let harness = TestHarness::new(FakeHost::new()).await.unwrap();
    assert!(harness.up(Role::Coordinator).await.result.is_ok());

    let report = teardown(Role::Coordinator, &harness.config, harness.runner(), false).await;

    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(harness.host.container_names().is_empty());
    assert!(harness.host.ran("ray stop"));

    // Nothing left to tear down
    let again = teardown(Role::Coordinator, &harness.config, harness.runner(), false).await;
    assert!(again.warnings.is_empty());
}
