//! Built-in diagnostic sections

use super::{Findings, Section, SectionProbe, SectionStatus};
use crate::capabilities::CapabilityDetector;
use crate::config::{ClusterConfig, Role};
use crate::discovery::{build_interfaces, parse_ibdev2netdev, select_interface, HostAddressing};
use crate::docker::{ContainerState, Docker};
use crate::execution::{CommandRunner, CommandSpec};
use crate::inference::{InferenceClient, SERVER_LOG};
use crate::metrics::{GpuMetrics, SystemMetrics};
use crate::ray;
use anyhow::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Log lines that point at a broken server
const LOG_ERROR_MARKERS: &[&str] = &["Traceback", "CUDA out of memory", "NCCL error", "RuntimeError"];

struct Tools;

#[async_trait]
impl SectionProbe for Tools {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let tools = CapabilityDetector::new(runner.as_ref()).detect_all().await;
        let missing_required = tools.iter().any(|t| t.tool.required() && !t.available);

        let mut findings = Findings::new(if missing_required {
            SectionStatus::Fail
        } else {
            SectionStatus::Pass
        });
        let mut notes = Vec::new();
        for tool in tools {
            findings = findings.fact(tool.tool.command(), if tool.available { "found" } else { "missing" });
            if let Some(reason) = tool.reason {
                notes.push(reason);
            }
        }
        Ok(findings.text(notes.join("\n")))
    }
}

struct Gpu;

#[async_trait]
impl SectionProbe for Gpu {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let gpus = GpuMetrics::collect(runner.as_ref()).await?;
        if gpus.is_empty() {
            return Ok(Findings::new(SectionStatus::Fail).fact("gpus", 0));
        }

        let mut findings = Findings::new(SectionStatus::Pass).fact("gpus", gpus.len());
        for gpu in &gpus {
            let memory = match (gpu.memory_used_mb, gpu.memory_total_mb) {
                (Some(used), Some(total)) => format!("{}/{} MiB", used, total),
                _ => "unified".to_string(),
            };
            findings = findings.fact(
                &format!("gpu{}", gpu.index),
                format!(
                    "{} | {} | util {} | {} | {}",
                    gpu.name,
                    optional(gpu.temperature_c, "°C"),
                    optional(gpu.utilization_percent, "%"),
                    memory,
                    optional(gpu.power_draw_w, " W"),
                ),
            );
        }
        Ok(findings)
    }
}

fn optional(value: Option<f32>, unit: &str) -> String {
    value.map(|v| format!("{}{}", v, unit)).unwrap_or_else(|| "n/a".to_string())
}

struct System {
    hf_cache: PathBuf,
}

#[async_trait]
impl SectionProbe for System {
    async fn probe(&self, _runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let metrics = SystemMetrics::collect().await?;
        let mut findings = Findings::new(SectionStatus::Pass)
            .fact("uptime", humantime::format_duration(Duration::from_secs(metrics.uptime_seconds)))
            .fact("cpu", format!("{:.1}% of {} cores", metrics.cpu.percent, metrics.cpu.core_count))
            .fact(
                "load",
                format!(
                    "{:.2} {:.2} {:.2}",
                    metrics.cpu.load_avg[0], metrics.cpu.load_avg[1], metrics.cpu.load_avg[2]
                ),
            )
            .fact(
                "memory",
                format!(
                    "{} / {} MiB ({:.1}%)",
                    metrics.memory.used_mb, metrics.memory.total_mb, metrics.memory.percent_used
                ),
            );

        if let Some(disk) = metrics.disk_for(&self.hf_cache) {
            findings = findings.fact(
                "model cache disk",
                format!("{} free {:.0} GiB of {:.0} GiB", disk.path, disk.free_gb, disk.total_gb),
            );
        }
        Ok(findings)
    }
}

struct Network {
    priority: Vec<String>,
}

/// Shell snippet printing `addr=<ipv4>` and `speed=<Mb/s>` for one netdev
fn link_facts_script(netdev: &str) -> String {
    format!(
        "echo \"addr=$(ip -4 -o addr show dev {0} 2>/dev/null | awk '{{print $4}}' | cut -d/ -f1 | head -n1)\"; \
         echo \"speed=$(cat /sys/class/net/{0}/speed 2>/dev/null)\"",
        netdev
    )
}

fn parse_link_facts(output: &str) -> (Option<Ipv4Addr>, Option<u32>) {
    let mut address = None;
    let mut speed = None;
    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("addr=") {
            address = value.trim().parse::<Ipv4Addr>().ok();
        } else if let Some(value) = line.strip_prefix("speed=") {
            // down links report -1
            speed = value.trim().parse::<i64>().ok().filter(|s| *s > 0).map(|s| s as u32);
        }
    }
    (address, speed)
}

#[async_trait]
impl SectionProbe for Network {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let result = runner
            .run(&CommandSpec::new("ibdev2netdev", Vec::<String>::new()).with_timeout(Duration::from_secs(10)))
            .await;
        if !result.success() {
            return Ok(Findings::new(SectionStatus::Unknown)
                .fact("ibdev2netdev", result.status_label())
                .text("RDMA tooling unavailable; NCCL will use the configured fallback interface"));
        }

        // Addresses and speeds are read through the runner so remote hosts report their own
        let links = parse_ibdev2netdev(&result.stdout);
        let mut host = HostAddressing::default();
        for link in &links {
            let output = runner
                .run(&CommandSpec::shell(&link_facts_script(&link.netdev)).with_timeout(Duration::from_secs(5)))
                .await;
            let (address, speed) = parse_link_facts(&output.stdout);
            if let Some(ip) = address {
                host.ipv4.insert(link.netdev.clone(), ip);
            }
            if let Some(speed) = speed {
                host.speed_mbps.insert(link.netdev.clone(), speed);
            }
        }

        let interfaces = build_interfaces(links, &host);
        let selected = select_interface(&interfaces, &self.priority);
        let mut findings = match selected {
            None => Findings::new(SectionStatus::Fail),
            Some(iface) if iface.address.is_none() => Findings::new(SectionStatus::Warn).text(format!(
                "{} is up but has no IPv4 address; set HEAD_IP/WORKER_IP or assign one",
                iface.name
            )),
            Some(_) => Findings::new(SectionStatus::Pass),
        };
        let selected = selected.map(|i| i.name.clone());

        for iface in &interfaces {
            findings = findings.fact(
                &iface.name,
                format!(
                    "{} port {} {} {} {}",
                    iface.hca,
                    iface.port,
                    iface.link_state,
                    iface.address.map(|a| a.to_string()).unwrap_or_else(|| "no address".to_string()),
                    iface
                        .link_speed_mbps
                        .map(|s| format!("{} Mb/s", s))
                        .unwrap_or_default(),
                ),
            );
        }
        Ok(findings.fact("selected", selected.unwrap_or_else(|| "none (no link up)".to_string())))
    }
}

/// Both role containers, regardless of which role this host plays
fn node_containers(config: &ClusterConfig) -> Vec<String> {
    let mut names = vec![config.container_name(Role::Coordinator), config.container_name(Role::Worker)];
    names.dedup();
    names
}

async fn running_container(docker: &Docker, names: &[String]) -> Option<String> {
    for name in names {
        if docker.state(name).await == ContainerState::Running {
            return Some(name.clone());
        }
    }
    None
}

struct Container {
    names: Vec<String>,
}

#[async_trait]
impl SectionProbe for Container {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let docker = Docker::new(runner, Duration::from_secs(15));
        let mut any_running = false;
        let mut findings = Findings::new(SectionStatus::Pass);

        for name in &self.names {
            let state = docker.state(name).await;
            any_running |= state == ContainerState::Running;
            findings = findings.fact(name, state.to_string());
        }

        if !any_running {
            findings.status = SectionStatus::Fail;
            findings.text = "no node container running; start one with `spark-agent up --role <role>`".to_string();
        }
        Ok(findings)
    }
}

struct Ray {
    names: Vec<String>,
    expected_nodes: usize,
}

#[async_trait]
impl SectionProbe for Ray {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let docker = Docker::new(runner, Duration::from_secs(15));
        let Some(container) = running_container(&docker, &self.names).await else {
            return Ok(Findings::new(SectionStatus::Unknown).text("no running node container"));
        };

        let version = docker
            .exec(&container, ray::version_script(), &[], Duration::from_secs(15))
            .await;
        let result = docker
            .exec(&container, ray::status_script(), &[], Duration::from_secs(20))
            .await;
        let status = ray::parse_ray_status(&result.stdout);

        let findings = Findings::new(if result.success() && status.active_nodes.len() >= self.expected_nodes {
            SectionStatus::Pass
        } else {
            SectionStatus::Fail
        })
        .fact("container", &container)
        .fact(
            "version",
            ray::parse_version(&version.stdout).unwrap_or_else(|| "unknown".to_string()),
        )
        .fact("active nodes", format!("{}/{}", status.active_nodes.len(), self.expected_nodes))
        .fact("pending nodes", status.pending_nodes_count)
        .fact("recent failures", status.recent_failures_count);

        Ok(findings.text(result.tail(15)))
    }
}

struct Inference {
    url: String,
    timeout: Duration,
}

#[async_trait]
impl SectionProbe for Inference {
    async fn probe(&self, _runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let client = InferenceClient::new(&self.url, self.timeout)?;
        let status = client.health().await?;

        let mut findings = Findings::new(if status == 200 {
            SectionStatus::Pass
        } else {
            SectionStatus::Fail
        })
        .fact("endpoint", &self.url)
        .fact("/health", status);

        if status == 200 {
            let model = match client.model_id().await {
                Ok(Some(id)) => id,
                Ok(None) => "none served".to_string(),
                Err(e) => format!("error: {:#}", e),
            };
            findings = findings.fact("model", model);
        }
        Ok(findings)
    }
}

struct Logs {
    names: Vec<String>,
}

#[async_trait]
impl SectionProbe for Logs {
    async fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Findings> {
        let docker = Docker::new(runner, Duration::from_secs(15));
        let Some(container) = running_container(&docker, &self.names).await else {
            return Ok(Findings::new(SectionStatus::Unknown).text("no running node container"));
        };

        let server_log = docker
            .exec(&container, &format!("tail -n 50 {}", SERVER_LOG), &[], Duration::from_secs(15))
            .await;
        let container_log = docker.logs_tail(&container, 20).await;

        let errors: Vec<&str> = server_log
            .stdout
            .lines()
            .filter(|line| LOG_ERROR_MARKERS.iter().any(|m| line.contains(m)))
            .collect();

        let status = if errors.is_empty() {
            SectionStatus::Pass
        } else {
            SectionStatus::Fail
        };
        let text = format!(
            "{}:\n{}\n\ndocker logs {}:\n{}",
            SERVER_LOG,
            server_log.tail(50),
            container,
            container_log.tail(20)
        );

        Ok(Findings::new(status)
            .fact("container", &container)
            .fact("error lines", errors.len())
            .text(text))
    }
}

fn tools_section() -> Section {
    Section {
        name: "tools",
        title: "Host tools",
        local_only: false,
        probe: Arc::new(Tools),
    }
}

fn gpu_section() -> Section {
    Section {
        name: "gpu",
        title: "GPU",
        local_only: false,
        probe: Arc::new(Gpu),
    }
}

fn container_section(config: &ClusterConfig) -> Section {
    Section {
        name: "container",
        title: "Node containers",
        local_only: false,
        probe: Arc::new(Container {
            names: node_containers(config),
        }),
    }
}

fn inference_section(config: &ClusterConfig) -> Section {
    Section {
        name: "inference",
        title: "Inference endpoint",
        local_only: true,
        probe: Arc::new(Inference {
            url: config.serve_url(),
            timeout: config.timeouts.http,
        }),
    }
}

/// Fast checks: tools, GPU, containers, inference endpoint
pub fn quick_sections(config: &ClusterConfig) -> Vec<Section> {
    vec![
        tools_section(),
        gpu_section(),
        container_section(config),
        inference_section(config),
    ]
}

/// Everything, in report order
pub fn full_sections(config: &ClusterConfig) -> Vec<Section> {
    vec![
        tools_section(),
        gpu_section(),
        Section {
            name: "system",
            title: "System resources",
            local_only: true,
            probe: Arc::new(System {
                hf_cache: config.container.hf_cache.clone(),
            }),
        },
        Section {
            name: "network",
            title: "RDMA network",
            local_only: false,
            probe: Arc::new(Network {
                priority: config.network.interface_priority.clone(),
            }),
        },
        container_section(config),
        Section {
            name: "ray",
            title: "Ray cluster",
            local_only: false,
            probe: Arc::new(Ray {
                names: node_containers(config),
                expected_nodes: config.node.expected_nodes as usize,
            }),
        },
        inference_section(config),
        Section {
            name: "logs",
            title: "Server logs",
            local_only: false,
            probe: Arc::new(Logs {
                names: node_containers(config),
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::ScriptedRunner;

    #[test]
    fn test_section_sets() {
        let config = ClusterConfig::default();
        let quick: Vec<&str> = quick_sections(&config).iter().map(|s| s.name).collect();
        assert_eq!(quick, ["tools", "gpu", "container", "inference"]);

        let full: Vec<&str> = full_sections(&config).iter().map(|s| s.name).collect();
        assert_eq!(full, ["tools", "gpu", "system", "network", "container", "ray", "inference", "logs"]);
    }

    #[tokio::test]
    async fn test_network_without_rdma_tooling_is_unknown() {
        let probe = Network {
            priority: vec!["enp1s0f1np1".to_string()],
        };
        let findings = probe.probe(Arc::new(ScriptedRunner::new())).await.unwrap();
        assert_eq!(findings.status, SectionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_network_reports_selected_interface() {
        let runner = ScriptedRunner::new()
            .on("ibdev2netdev", 0, "mlx5_0 port 1 ==> enp1s0f0np0 (Down)\nmlx5_1 port 1 ==> enp1s0f1np1 (Up)\n")
            .on("dev enp1s0f1np1", 0, "addr=192.168.100.10\nspeed=200000\n");
        let probe = Network {
            priority: vec!["enp1s0f1np1".to_string()],
        };

        let findings = probe.probe(Arc::new(runner)).await.unwrap();
        assert_eq!(findings.status, SectionStatus::Pass);
        assert!(findings.facts.contains(&("selected".to_string(), "enp1s0f1np1".to_string())));
        let row = &findings.facts.iter().find(|(k, _)| k == "enp1s0f1np1").unwrap().1;
        assert!(row.contains("192.168.100.10"));
        assert!(row.contains("200000 Mb/s"));
    }

    #[tokio::test]
    async fn test_network_without_address_keeps_speed_and_warns() {
        let runner = ScriptedRunner::new()
            .on("ibdev2netdev", 0, "rocep1s0f1 port 1 ==> enp1s0f1np1 (Up)\n")
            .on("dev enp1s0f1np1", 0, "addr=\nspeed=200000\n");
        let probe = Network {
            priority: vec!["enp1s0f1np1".to_string()],
        };

        let findings = probe.probe(Arc::new(runner)).await.unwrap();
        assert_eq!(findings.status, SectionStatus::Warn);
        let row = &findings.facts.iter().find(|(k, _)| k == "enp1s0f1np1").unwrap().1;
        assert!(row.contains("no address"));
        assert!(row.contains("200000 Mb/s"));
        assert!(findings.text.contains("no IPv4 address"));
    }

    #[test]
    fn test_parse_link_facts_by_label() {
        assert_eq!(
            parse_link_facts("speed=100000\naddr=10.0.0.7\n"),
            (Some(Ipv4Addr::new(10, 0, 0, 7)), Some(100_000))
        );
        assert_eq!(parse_link_facts("addr=\nspeed=-1\n"), (None, None));
        assert_eq!(parse_link_facts(""), (None, None));
    }

    #[tokio::test]
    async fn test_logs_flag_tracebacks() {
        let runner = ScriptedRunner::new()
            .on("docker inspect", 0, "running\n")
            .on("tail -n 50", 0, "INFO loading\nTraceback (most recent call last):\n")
            .on("docker logs", 0, "");
        let probe = Logs {
            names: vec!["ray-head".to_string()],
        };

        let findings = probe.probe(Arc::new(runner)).await.unwrap();
        assert_eq!(findings.status, SectionStatus::Fail);
        assert!(findings.facts.contains(&("error lines".to_string(), "1".to_string())));
    }
}
