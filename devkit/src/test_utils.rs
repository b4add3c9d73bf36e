/*!
Test harness for end-to-end scenarios without hardware

Pairs a [`FakeHost`] with a [`FakeInferenceServer`] and a `ClusterConfig`
pointing every coordinator port (Ray GCS, dashboard, inference API) at the
fake server, with millisecond polling so scenarios finish quickly.
*/

use crate::fake_host::FakeHost;
use crate::fake_server::{FakeInferenceServer, FakeServerOptions};
use anyhow::Result;
use spark_agent::bringup::{bring_up, BringupRun};
use spark_agent::config::{ClusterConfig, Role};
use spark_agent::execution::CommandRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TEST_IMAGE: &str = "nvcr.io/nvidia/vllm:25.10-py3";

pub struct TestHarness {
    pub host: Arc<FakeHost>,
    pub server: FakeInferenceServer,
    pub config: ClusterConfig,
}

impl TestHarness {
    pub async fn new(host: FakeHost) -> Result<Self> {
        Self::with_server(host, FakeServerOptions::default()).await
    }

    pub async fn with_server(host: FakeHost, options: FakeServerOptions) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let server = FakeInferenceServer::start_with(options).await?;
        let config = test_config(server.port());
        Ok(Self {
            host: Arc::new(host),
            server,
            config,
        })
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.host.clone()
    }

    pub async fn up(&self, role: Role) -> BringupRun {
        bring_up(role, self.config.clone(), self.runner(), CancellationToken::new()).await
    }

    pub async fn up_with(&self, role: Role, config: ClusterConfig, cancel: CancellationToken) -> BringupRun {
        bring_up(role, config, self.runner(), cancel).await
    }
}

/// Configuration with every coordinator endpoint on `port` and fast polling
pub fn test_config(port: u16) -> ClusterConfig {
    let mut config = ClusterConfig::default();

    config.node.head_ip = Some("127.0.0.1".to_string());
    config.node.worker_ip = Some("127.0.0.1".to_string());
    config.node.expected_nodes = 2;

    config.container.image = TEST_IMAGE.to_string();
    config.container.hf_cache = PathBuf::from("/tmp/spark-devkit-hf-cache");

    config.ray.version = "2.51.0".to_string();
    config.ray.port = port;
    config.ray.dashboard_port = port;

    config.serve.model = "test-model".to_string();
    config.serve.port = port;
    config.serve.tensor_parallel = 2;

    config.polling.interval = Duration::from_millis(5);
    config.polling.reachability_attempts = 3;
    config.polling.ray_start_attempts = 5;
    config.polling.worker_join_attempts = 5;
    config.polling.server_ready_attempts = 20;

    config.timeouts.command = Duration::from_secs(5);
    config.timeouts.pull = Duration::from_secs(5);
    config.timeouts.install = Duration::from_secs(5);
    config.timeouts.download = Duration::from_secs(5);
    config.timeouts.http = Duration::from_secs(2);

    config.diagnostics.remote_timeout = Duration::from_secs(2);
    config.diagnostics.section_timeout = Duration::from_secs(5);

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validates_for_both_roles() {
        let config = test_config(18080);
        assert!(config.validate_for(Role::Coordinator).is_ok());
        assert!(config.validate_for(Role::Worker).is_ok());
        assert_eq!(config.serve_url(), "http://127.0.0.1:18080");
    }
}
