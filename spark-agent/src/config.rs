//! Cluster configuration
//!
//! Handles:
//! - Built-in defaults for a two-node DGX Spark cluster
//! - TOML config file in the OS config directory
//! - `.env` and environment variable overrides
//! - Gated-model token storage in the OS keyring
//! - Per-role validation before any action is taken

use crate::error::ConfigError;
use anyhow::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const KEYRING_SERVICE: &str = "spark-agent";
const KEYRING_TOKEN_ENTRY: &str = "hf-token";

/// Node role within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node: NodeConfig,
    pub container: ContainerConfig,
    pub ray: RayConfig,
    pub serve: ServeConfig,
    pub network: NetworkConfig,
    pub polling: PollingConfig,
    pub timeouts: TimeoutConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Coordinator address; required on workers
    pub head_ip: Option<String>,
    pub worker_ip: Option<String>,
    /// Ray nodes that must be active before the cluster counts as complete
    pub expected_nodes: u32,
    /// Downgrade a missing worker from fatal to a warning
    pub allow_partial_cluster: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container name; defaults to `ray-head` / `ray-worker` per role
    pub name: Option<String>,
    pub image: String,
    pub shm_size: String,
    pub hf_cache: PathBuf,
    pub skip_pull: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RayConfig {
    pub version: String,
    pub port: u16,
    pub dashboard_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub model: String,
    pub tensor_parallel: u32,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f32,
    pub port: u16,
    pub extra_args: Vec<String>,
    pub skip_download: bool,
    #[serde(skip)] // Never written to disk
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface name prefixes, most preferred first
    pub interface_priority: Vec<String>,
    pub fallback_interface: String,
    pub fallback_hca: String,
}

/// Poll cadence and bounds for every readiness wait
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "human_duration")]
    pub interval: Duration,
    pub reachability_attempts: u32,
    pub ray_start_attempts: u32,
    pub worker_join_attempts: u32,
    pub server_ready_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "human_duration")]
    pub command: Duration,
    #[serde(with = "human_duration")]
    pub pull: Duration,
    #[serde(with = "human_duration")]
    pub install: Duration,
    #[serde(with = "human_duration")]
    pub download: Duration,
    #[serde(with = "human_duration")]
    pub http: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub remote_hosts: Vec<String>,
    pub ssh_user: Option<String>,
    #[serde(with = "human_duration")]
    pub remote_timeout: Duration,
    #[serde(with = "human_duration")]
    pub section_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            container: ContainerConfig::default(),
            ray: RayConfig::default(),
            serve: ServeConfig::default(),
            network: NetworkConfig::default(),
            polling: PollingConfig::default(),
            timeouts: TimeoutConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            head_ip: None,
            worker_ip: None,
            expected_nodes: 2,
            allow_partial_cluster: false,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let hf_cache = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".cache")
            .join("huggingface");

        Self {
            name: None,
            image: "nvcr.io/nvidia/vllm:25.10-py3".to_string(),
            shm_size: "16g".to_string(),
            hf_cache,
            skip_pull: false,
        }
    }
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            version: "2.51.0".to_string(),
            port: 6379,
            dashboard_port: 8265,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            model: "meta-llama/Llama-3.3-70B-Instruct".to_string(),
            tensor_parallel: 2,
            max_model_len: 8192,
            gpu_memory_utilization: 0.90,
            port: 8000,
            extra_args: Vec::new(),
            skip_download: false,
            hf_token: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface_priority: vec![
                "enp1s0f1np1".to_string(),
                "enp1s0f0np0".to_string(),
                "enP2p1s0f1np1".to_string(),
                "enP2p1s0f0np0".to_string(),
            ],
            fallback_interface: "enp1s0f1np1".to_string(),
            fallback_hca: "mlx5_1".to_string(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            reachability_attempts: 30,
            ray_start_attempts: 30,
            worker_join_attempts: 30,
            server_ready_attempts: 900,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(120),
            pull: Duration::from_secs(30 * 60),
            install: Duration::from_secs(10 * 60),
            download: Duration::from_secs(2 * 60 * 60),
            http: Duration::from_secs(10),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            remote_hosts: Vec::new(),
            ssh_user: None,
            remote_timeout: Duration::from_secs(15),
            section_timeout: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// Load defaults, then the config file, then `.env` and the process environment
    pub async fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_file_path();

        let mut config = match &config_path {
            Some(path) if path.exists() => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| ConfigError::File {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                toml::from_str::<ClusterConfig>(&content).map_err(|e| ConfigError::File {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
            }
            _ => Self::default(),
        };

        // .env is optional
        dotenvy::dotenv().ok();
        config.apply_env_from(|key| std::env::var(key).ok())?;

        if config.serve.hf_token.is_none() {
            config.serve.hf_token = Self::load_token().ok();
        }

        Ok(config)
    }

    /// Save config to the OS-specific location (token excluded)
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file_path()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(config_path)
    }

    /// `SPARK_CONFIG` if set, otherwise `<config dir>/spark-agent/config.toml`
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SPARK_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()?;
        path.push("spark-agent");
        path.push("config.toml");
        Some(path)
    }

    /// Overlay recognized environment variables using the given lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("HEAD_IP") {
            self.node.head_ip = Some(v);
        }
        if let Some(v) = get("WORKER_IP") {
            self.node.worker_ip = Some(v);
        }
        if let Some(v) = get("EXPECTED_NODES") {
            self.node.expected_nodes = parse_env("EXPECTED_NODES", &v)?;
        }
        if let Some(v) = get("ALLOW_PARTIAL_CLUSTER") {
            self.node.allow_partial_cluster = parse_bool("ALLOW_PARTIAL_CLUSTER", &v)?;
        }
        if let Some(v) = get("MODEL") {
            self.serve.model = v;
        }
        if let Some(v) = get("TENSOR_PARALLEL") {
            self.serve.tensor_parallel = parse_env("TENSOR_PARALLEL", &v)?;
        }
        if let Some(v) = get("MAX_MODEL_LEN") {
            self.serve.max_model_len = parse_env("MAX_MODEL_LEN", &v)?;
        }
        if let Some(v) = get("GPU_MEMORY_UTIL") {
            self.serve.gpu_memory_utilization = parse_env("GPU_MEMORY_UTIL", &v)?;
        }
        if let Some(v) = get("VLLM_PORT") {
            self.serve.port = parse_env("VLLM_PORT", &v)?;
        }
        if let Some(v) = get("HF_TOKEN") {
            self.serve.hf_token = Some(v);
        }
        if let Some(v) = get("CONTAINER_NAME") {
            self.container.name = Some(v);
        }
        if let Some(v) = get("IMAGE") {
            self.container.image = v;
        }
        if let Some(v) = get("HF_CACHE") {
            self.container.hf_cache = PathBuf::from(v);
        }
        if let Some(v) = get("RAY_VERSION") {
            self.ray.version = v;
        }
        if let Some(v) = get("RAY_PORT") {
            self.ray.port = parse_env("RAY_PORT", &v)?;
        }
        if let Some(v) = get("DASHBOARD_PORT") {
            self.ray.dashboard_port = parse_env("DASHBOARD_PORT", &v)?;
        }
        if let Some(v) = get("REMOTE_HOSTS") {
            self.diagnostics.remote_hosts = split_list(&v);
        }
        if let Some(v) = get("SSH_USER") {
            self.diagnostics.ssh_user = Some(v);
        }
        if let Some(v) = get("POLL_INTERVAL") {
            self.polling.interval = humantime::parse_duration(&v)
                .map_err(|e| ConfigError::invalid("POLL_INTERVAL", v.clone(), e))?;
        }

        Ok(())
    }

    /// Reject configurations that cannot work for `role` before anything runs
    pub fn validate_for(&self, role: Role) -> Result<(), ConfigError> {
        if role == Role::Worker && self.node.head_ip.is_none() {
            return Err(ConfigError::Missing { var: "HEAD_IP", role });
        }

        if self.serve.model.trim().is_empty() {
            return Err(ConfigError::invalid("MODEL", "", "model identifier must not be empty"));
        }
        if self.serve.tensor_parallel == 0 {
            return Err(ConfigError::invalid("TENSOR_PARALLEL", "0", "must be at least 1"));
        }
        let util = self.serve.gpu_memory_utilization;
        if !(util > 0.0 && util <= 1.0) {
            return Err(ConfigError::invalid(
                "GPU_MEMORY_UTIL",
                util.to_string(),
                "must be within (0, 1]",
            ));
        }
        if self.node.expected_nodes == 0 {
            return Err(ConfigError::invalid("EXPECTED_NODES", "0", "must be at least 1"));
        }

        Ok(())
    }

    pub fn container_name(&self, role: Role) -> String {
        self.container.name.clone().unwrap_or_else(|| match role {
            Role::Coordinator => "ray-head".to_string(),
            Role::Worker => "ray-worker".to_string(),
        })
    }

    /// Address configured for this node's role, if any
    pub fn configured_address(&self, role: Role) -> Option<&str> {
        match role {
            Role::Coordinator => self.node.head_ip.as_deref(),
            Role::Worker => self.node.worker_ip.as_deref(),
        }
    }

    /// Base URL of the inference server on the coordinator
    pub fn serve_url(&self) -> String {
        let host = self.node.head_ip.as_deref().unwrap_or("127.0.0.1");
        format!("http://{}:{}", host, self.serve.port)
    }

    /// SSH targets for remote diagnostics
    pub fn remote_targets(&self) -> Vec<crate::execution::SshTarget> {
        self.diagnostics
            .remote_hosts
            .iter()
            .map(|host| crate::execution::SshTarget {
                host: host.clone(),
                user: self.diagnostics.ssh_user.clone(),
                connect_timeout: self.diagnostics.remote_timeout,
            })
            .collect()
    }

    /// Load the gated-model token from the OS keyring
    pub fn load_token() -> Result<String> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_TOKEN_ENTRY)?;
        entry.get_password().map_err(Into::into)
    }

    /// Store the gated-model token in the OS keyring
    pub fn save_token(token: &str) -> Result<()> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_TOKEN_ENTRY)?;
        entry.set_password(token).map_err(Into::into)
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(var, value, e))
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, value, "expected true/false")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Durations as human strings ("90s", "10m") in the config file
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
