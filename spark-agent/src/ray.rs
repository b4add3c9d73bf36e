//! Ray coordination runtime: scripts, version checks and status parsing
//!
//! Ray itself runs inside the node container; this module only builds the
//! shell snippets executed there and parses what they print.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RayStatus {
    pub active_nodes: Vec<String>,
    pub pending_nodes_count: usize,
    pub recent_failures_count: usize,
}

pub fn install_script(version: &str) -> String {
    format!("pip install --quiet --upgrade 'ray[default]=={}'", version)
}

pub fn version_script() -> &'static str {
    "ray --version"
}

pub fn status_script() -> &'static str {
    "ray status"
}

pub fn stop_script() -> &'static str {
    "ray stop --force"
}

pub fn head_start_script(node_ip: &str, port: u16, dashboard_port: u16) -> String {
    format!(
        "ray start --head --port={} --node-ip-address={} --dashboard-host=0.0.0.0 --dashboard-port={} --disable-usage-stats",
        port, node_ip, dashboard_port
    )
}

pub fn worker_start_script(head_ip: &str, port: u16, node_ip: &str) -> String {
    format!(
        "ray start --address={}:{} --node-ip-address={} --disable-usage-stats",
        head_ip, port, node_ip
    )
}

/// Extract the version from `ray --version` ("ray, version 2.51.0")
pub fn parse_version(output: &str) -> Option<String> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let re = VERSION.get_or_init(|| Regex::new(r"version\s+(\d+\.\d+\.\d+\S*)").expect("static regex"));

    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct DashboardVersion {
    ray_version: String,
}

/// Ray version the coordinator is running, read from its dashboard
pub async fn coordinator_version(http: &reqwest::Client, head_ip: &str, dashboard_port: u16) -> Result<String> {
    let url = format!("http://{}:{}/api/version", head_ip, dashboard_port);
    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to query {}", url))?
        .error_for_status()
        .with_context(|| format!("Dashboard rejected {}", url))?;

    let version: DashboardVersion = response
        .json()
        .await
        .context("Invalid dashboard version payload")?;
    Ok(version.ray_version)
}

/// Parse the output of `ray status`
pub fn parse_ray_status(output: &str) -> RayStatus {
    static NODE: OnceLock<Regex> = OnceLock::new();
    static COUNT: OnceLock<Regex> = OnceLock::new();
    let node_regex = NODE.get_or_init(|| Regex::new(r"(\d+)\s+(node_[a-f0-9]+)").expect("static regex"));
    let num_regex = COUNT.get_or_init(|| Regex::new(r"(\d+)").expect("static regex"));

    let mut status = RayStatus::default();

    #[derive(PartialEq)]
    enum Section {
        None,
        Active,
        Pending,
        Failures,
    }
    let mut section = Section::None;

    for line in output.lines() {
        let trimmed = line.trim();

        match trimmed {
            "Active:" => {
                section = Section::Active;
                continue;
            }
            "Pending:" => {
                section = Section::Pending;
                continue;
            }
            "Recent failures:" => {
                section = Section::Failures;
                continue;
            }
            _ if trimmed.starts_with("Resources") => break,
            _ => {}
        }

        match section {
            Section::Active => {
                if let Some(node_id) = node_regex.captures(trimmed).and_then(|c| c.get(2)) {
                    status.active_nodes.push(node_id.as_str().to_string());
                }
            }
            Section::Pending if trimmed != "(no pending nodes)" => {
                status.pending_nodes_count += leading_count(num_regex, trimmed);
            }
            Section::Failures if trimmed != "(no failures)" => {
                status.recent_failures_count += leading_count(num_regex, trimmed);
            }
            _ => {}
        }
    }

    status
}

fn leading_count(re: &Regex, line: &str) -> usize {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODES: &str = r#"======== Autoscaler status: 2025-10-14 13:13:59.104771 ========
Node status
---------------------------------------------------------------
Active:
 1 node_b09a7440bd0987680f97c35206b2475251907d0c928fdd0f52b1b38f
 1 node_035ea3b640e13f3603d3debd97de8c569ed8c8b10e19ce00ea4fd070
Pending:
 (no pending nodes)
Recent failures:
 (no failures)

Resources
---------------------------------------------------------------
Usage:
 0.0/40.0 CPU
 0.0/2.0 GPU
"#;

    #[test]
    fn test_parse_two_active_nodes() {
        let status = parse_ray_status(TWO_NODES);
        assert_eq!(status.active_nodes.len(), 2);
        assert_eq!(status.pending_nodes_count, 0);
        assert_eq!(status.recent_failures_count, 0);
    }

    #[test]
    fn test_parse_pending_and_failures() {
        let output = "Active:\n 1 node_b09a\nPending:\n 2 node_pending_1\nRecent failures:\n 1 node_failure_1\n 4 node_failure_2\nResources\n";
        let status = parse_ray_status(output);
        assert_eq!(status.active_nodes, vec!["node_b09a".to_string()]);
        assert_eq!(status.pending_nodes_count, 2);
        assert_eq!(status.recent_failures_count, 5);
    }

    #[test]
    fn test_parse_empty_status() {
        assert_eq!(parse_ray_status(""), RayStatus::default());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("ray, version 2.51.0\n").as_deref(), Some("2.51.0"));
        assert_eq!(parse_version("ray, version 2.50.0rc1").as_deref(), Some("2.50.0rc1"));
        assert_eq!(parse_version("bash: ray: command not found"), None);
    }

    #[test]
    fn test_start_scripts() {
        assert_eq!(
            worker_start_script("192.168.100.10", 6379, "192.168.100.11"),
            "ray start --address=192.168.100.10:6379 --node-ip-address=192.168.100.11 --disable-usage-stats"
        );
        assert!(head_start_script("192.168.100.10", 6379, 8265).starts_with("ray start --head --port=6379"));
        assert!(install_script("2.51.0").contains("'ray[default]==2.51.0'"));
    }
}
