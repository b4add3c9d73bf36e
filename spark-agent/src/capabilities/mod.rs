//! Node capability detection for Spark agents
//!
//! Detects and reports what a node can do before bring-up:
//! - Host tools (docker, nvidia-smi, ibdev2netdev, ssh)
//! - GPU inventory via `nvidia-smi -L`
//! - RDMA presence

use crate::execution::{command_exists, CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Host tools the agent relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Docker,
    NvidiaSmi,
    Ibdev2netdev,
    Ssh,
}

impl ToolType {
    pub const ALL: [ToolType; 4] = [ToolType::Docker, ToolType::NvidiaSmi, ToolType::Ibdev2netdev, ToolType::Ssh];

    pub fn command(&self) -> &'static str {
        match self {
            ToolType::Docker => "docker",
            ToolType::NvidiaSmi => "nvidia-smi",
            ToolType::Ibdev2netdev => "ibdev2netdev",
            ToolType::Ssh => "ssh",
        }
    }

    /// Bring-up cannot work without this tool
    pub fn required(&self) -> bool {
        matches!(self, ToolType::Docker | ToolType::NvidiaSmi)
    }

    fn missing_reason(&self) -> &'static str {
        match self {
            ToolType::Docker => "docker CLI not found; containers cannot be started",
            ToolType::NvidiaSmi => "nvidia-smi not found; NVIDIA driver missing?",
            ToolType::Ibdev2netdev => "ibdev2netdev not found; default RDMA interface will be used",
            ToolType::Ssh => "ssh not found; remote diagnostics unavailable",
        }
    }
}

/// Tool detection result
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub tool: ToolType,
    pub available: bool,
    pub reason: Option<String>,
}

/// Capabilities declared by a node once its container is up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub hostname: String,
    pub gpu_count: usize,
    pub gpu_names: Vec<String>,
    pub rdma: bool,
}

pub struct CapabilityDetector<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> CapabilityDetector<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Detect every host tool
    pub async fn detect_all(&self) -> Vec<CapabilityInfo> {
        debug!("Detecting host tools...");

        let mut capabilities = Vec::new();
        for tool in ToolType::ALL {
            let available = command_exists(self.runner, tool.command()).await;
            if !available {
                if tool.required() {
                    warn!("{}", tool.missing_reason());
                } else {
                    debug!("{}", tool.missing_reason());
                }
            }
            capabilities.push(CapabilityInfo {
                tool,
                available,
                reason: (!available).then(|| tool.missing_reason().to_string()),
            });
        }

        let available_count = capabilities.iter().filter(|c| c.available).count();
        debug!("Detected {}/{} tools available", available_count, capabilities.len());

        capabilities
    }

    /// GPU names from `nvidia-smi -L`; empty when the driver is unavailable
    pub async fn gpus(&self) -> Vec<String> {
        let spec = CommandSpec::new("nvidia-smi", ["-L"]).with_timeout(Duration::from_secs(15));
        let result = self.runner.run(&spec).await;
        if !result.success() {
            warn!("nvidia-smi -L failed: {}", result.status_label());
            return Vec::new();
        }
        parse_gpu_list(&result.stdout)
    }

    pub async fn node_capabilities(&self, rdma: bool) -> NodeCapabilities {
        let gpu_names = self.gpus().await;
        NodeCapabilities {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            gpu_count: gpu_names.len(),
            gpu_names,
            rdma,
        }
    }
}

/// `GPU 0: NVIDIA GB10 (UUID: GPU-...)` → `NVIDIA GB10`
pub fn parse_gpu_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with("GPU "))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, rest)| rest.split(" (UUID").next().unwrap_or(rest).trim().to_string())
        .collect()
}
