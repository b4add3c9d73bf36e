//! RDMA network discovery for Spark nodes
//!
//! This module handles:
//! - RDMA device to netdev mapping via `ibdev2netdev`
//! - IPv4 address, MAC and link speed per interface
//! - Interface selection by configured name priority
//! - NCCL / Gloo / UCX environment derived from the selection
//!
//! Detection never fails: a host without RDMA tooling yields an empty list and
//! callers fall back to configured defaults.

use crate::config::NetworkConfig;
use crate::execution::{CommandRunner, CommandSpec};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => write!(f, "up"),
            LinkState::Down => write!(f, "down"),
        }
    }
}

/// Snapshot of one RDMA-backed network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    /// RDMA device backing this netdev (e.g. `mlx5_1`)
    pub hca: String,
    pub port: u8,
    pub link_state: LinkState,
    pub address: Option<Ipv4Addr>,
    pub mac: Option<String>,
    pub link_speed_mbps: Option<u32>,
}

impl NetworkInterface {
    pub fn is_up(&self) -> bool {
        self.link_state == LinkState::Up
    }
}

/// One `ibdev2netdev` line: `mlx5_0 port 1 ==> enp1s0f0np0 (Up)`
#[derive(Debug, Clone, PartialEq)]
pub struct RdmaLink {
    pub hca: String,
    pub port: u8,
    pub netdev: String,
    pub link_state: LinkState,
}

pub fn parse_ibdev2netdev(output: &str) -> Vec<RdmaLink> {
    output.lines().filter_map(parse_link_line).collect()
}

fn parse_link_line(line: &str) -> Option<RdmaLink> {
    let (device, rest) = line.split_once("==>")?;

    let mut device_parts = device.split_whitespace();
    let hca = device_parts.next()?.to_string();
    let port = match (device_parts.next(), device_parts.next()) {
        (Some("port"), Some(n)) => n.parse().ok()?,
        _ => 1,
    };

    let mut rest_parts = rest.split_whitespace();
    let netdev = rest_parts.next()?.to_string();
    let link_state = match rest_parts.next() {
        Some(state) if state.trim_matches(|c| c == '(' || c == ')').eq_ignore_ascii_case("up") => LinkState::Up,
        _ => LinkState::Down,
    };

    Some(RdmaLink {
        hca,
        port,
        netdev,
        link_state,
    })
}

/// Per-interface facts gathered from the host
#[derive(Debug, Clone, Default)]
pub struct HostAddressing {
    pub ipv4: HashMap<String, Ipv4Addr>,
    pub mac: HashMap<String, String>,
    pub speed_mbps: HashMap<String, u32>,
}

/// Join RDMA links with host addressing, keeping discovery order
pub fn build_interfaces(links: Vec<RdmaLink>, host: &HostAddressing) -> Vec<NetworkInterface> {
    links
        .into_iter()
        .map(|link| NetworkInterface {
            address: host.ipv4.get(&link.netdev).copied(),
            mac: host.mac.get(&link.netdev).cloned(),
            link_speed_mbps: host.speed_mbps.get(&link.netdev).copied(),
            name: link.netdev,
            hca: link.hca,
            port: link.port,
            link_state: link.link_state,
        })
        .collect()
}

/// Pick the preferred up interface: priority prefixes in order, then first up
pub fn select_interface<'a>(interfaces: &'a [NetworkInterface], priority: &[String]) -> Option<&'a NetworkInterface> {
    for prefix in priority {
        if let Some(found) = interfaces
            .iter()
            .find(|iface| iface.is_up() && iface.name.starts_with(prefix.as_str()))
        {
            return Some(found);
        }
    }

    interfaces.iter().find(|iface| iface.is_up())
}

/// Host network facts via `ibdev2netdev`, `if-addrs` and sysfs
pub struct NetworkDetector {
    runner: Arc<dyn CommandRunner>,
    sysfs_net: PathBuf,
}

impl NetworkDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    /// Read link speeds from a different sysfs root
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_net = root.into();
        self
    }

    /// Discover RDMA interfaces; empty when the RDMA tooling is unavailable
    pub async fn detect(&self) -> Vec<NetworkInterface> {
        debug!("Querying RDMA devices...");

        let spec = CommandSpec::new("ibdev2netdev", Vec::<String>::new()).with_timeout(Duration::from_secs(10));
        let result = self.runner.run(&spec).await;
        if !result.success() {
            warn!("ibdev2netdev unavailable ({}), no RDMA interfaces detected", result.status_label());
            return Vec::new();
        }

        let links = parse_ibdev2netdev(&result.stdout);
        let host = self.host_addressing(&links);
        let interfaces = build_interfaces(links, &host);

        for iface in &interfaces {
            debug!(
                "Found interface: {} ({} port {}, {}, {:?})",
                iface.name, iface.hca, iface.port, iface.link_state, iface.address
            );
        }
        info!(
            "Detected {} RDMA interfaces ({} up)",
            interfaces.len(),
            interfaces.iter().filter(|i| i.is_up()).count()
        );

        interfaces
    }

    fn host_addressing(&self, links: &[RdmaLink]) -> HostAddressing {
        let mut host = HostAddressing::default();

        match get_if_addrs() {
            Ok(addrs) => {
                for if_addr in addrs {
                    if let IfAddr::V4(v4) = if_addr.addr {
                        host.ipv4.entry(if_addr.name.clone()).or_insert(v4.ip);
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate interface addresses: {}", e),
        }

        for link in links {
            match mac_address::mac_address_by_name(&link.netdev) {
                Ok(Some(mac)) => {
                    host.mac.insert(link.netdev.clone(), mac.to_string().to_lowercase());
                }
                Ok(None) => debug!("No MAC found for interface: {}", link.netdev),
                Err(e) => debug!("Error getting MAC for {}: {}", link.netdev, e),
            }

            if let Some(speed) = read_link_speed(&self.sysfs_net, &link.netdev) {
                host.speed_mbps.insert(link.netdev.clone(), speed);
            }
        }

        host
    }
}

/// `<root>/<iface>/speed`; down links report -1
fn read_link_speed(root: &Path, iface: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(root.join(iface).join("speed")).ok()?;
    raw.trim().parse::<i64>().ok().filter(|s| *s > 0).map(|s| s as u32)
}

/// This node's own address when neither configuration nor the selected
/// interface provides one.
///
/// Order: the IPv4 of `preferred_interface`, then the first non-loopback,
/// non-link-local IPv4 on the host, then loopback.
pub fn default_node_address(preferred_interface: &str) -> Ipv4Addr {
    let candidates: Vec<(String, Ipv4Addr)> = match get_if_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .filter_map(|if_addr| match if_addr.addr {
                IfAddr::V4(v4) => Some((if_addr.name, v4.ip)),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate interface addresses: {}", e);
            Vec::new()
        }
    };

    pick_default_address(&candidates, preferred_interface).unwrap_or(Ipv4Addr::LOCALHOST)
}

fn pick_default_address(candidates: &[(String, Ipv4Addr)], preferred_interface: &str) -> Option<Ipv4Addr> {
    let routable = |ip: &Ipv4Addr| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified();

    candidates
        .iter()
        .find(|(name, ip)| name == preferred_interface && routable(ip))
        .or_else(|| candidates.iter().find(|(_, ip)| routable(ip)))
        .map(|(_, ip)| *ip)
}

/// Interface chosen for inter-node traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSelection {
    pub interface: String,
    pub hca: String,
    pub address: Option<String>,
    pub speed_mbps: Option<u32>,
    /// True when nothing was detected and configured defaults were used
    pub fallback: bool,
}

impl NetworkSelection {
    /// Choose from detected interfaces or fall back to configured defaults.
    ///
    /// A configured address always wins over the detected one, since it is the
    /// address the peer node was told to use.
    pub fn resolve(interfaces: &[NetworkInterface], network: &NetworkConfig, configured_address: Option<&str>) -> Self {
        match select_interface(interfaces, &network.interface_priority) {
            Some(iface) => {
                info!("Selected interface {} ({})", iface.name, iface.hca);
                Self {
                    interface: iface.name.clone(),
                    hca: iface.hca.clone(),
                    address: configured_address
                        .map(String::from)
                        .or_else(|| iface.address.map(|a| a.to_string())),
                    speed_mbps: iface.link_speed_mbps,
                    fallback: false,
                }
            }
            None => {
                warn!(
                    "No active RDMA interface found, falling back to {} / {}",
                    network.fallback_interface, network.fallback_hca
                );
                Self {
                    interface: network.fallback_interface.clone(),
                    hca: network.fallback_hca.clone(),
                    address: configured_address.map(String::from),
                    speed_mbps: None,
                    fallback: true,
                }
            }
        }
    }

    /// Environment pinning NCCL, Gloo and UCX to the selected fabric
    pub fn nccl_env(&self) -> Vec<(String, String)> {
        vec![
            ("NCCL_SOCKET_IFNAME".to_string(), self.interface.clone()),
            ("GLOO_SOCKET_IFNAME".to_string(), self.interface.clone()),
            ("TP_SOCKET_IFNAME".to_string(), self.interface.clone()),
            ("UCX_NET_DEVICES".to_string(), self.interface.clone()),
            ("NCCL_IB_HCA".to_string(), self.hca.clone()),
            ("NCCL_IB_DISABLE".to_string(), "0".to_string()),
        ]
    }

    pub fn speed_label(&self) -> String {
        match self.speed_mbps {
            Some(mbps) if mbps >= 1000 => format!("{} Gb/s", mbps / 1000),
            Some(mbps) => format!("{} Mb/s", mbps),
            None => "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::ScriptedRunner;
    use crate::execution::ExecFailure;

    const SPARK_OUTPUT: &str = "\
mlx5_0 port 1 ==> enp1s0f0np0 (Down)
mlx5_1 port 1 ==> enp1s0f1np1 (Up)
mlx5_2 port 1 ==> enP2p1s0f0np0 (Down)
mlx5_3 port 1 ==> enP2p1s0f1np1 (Up)
";

    fn iface(name: &str, hca: &str, state: LinkState) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            hca: hca.to_string(),
            port: 1,
            link_state: state,
            address: None,
            mac: None,
            link_speed_mbps: None,
        }
    }

    #[test]
    fn test_parse_ibdev2netdev() {
        let links = parse_ibdev2netdev(SPARK_OUTPUT);
        assert_eq!(links.len(), 4);
        assert_eq!(links[1].hca, "mlx5_1");
        assert_eq!(links[1].netdev, "enp1s0f1np1");
        assert_eq!(links[1].link_state, LinkState::Up);
        assert_eq!(links[0].link_state, LinkState::Down);
    }

    #[test]
    fn test_parse_ignores_noise() {
        let links = parse_ibdev2netdev("bash: warning\n\nmlx5_0 port 2 ==> ib0 (Up)\n");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].port, 2);
    }

    #[test]
    fn test_priority_wins_regardless_of_order() {
        let priority = vec!["enp1s0f1np1".to_string()];
        let matching = iface("enp1s0f1np1", "mlx5_1", LinkState::Up);
        let other = iface("ib0", "mlx5_0", LinkState::Up);

        let forward = vec![other.clone(), matching.clone()];
        let reverse = vec![matching, other];

        assert_eq!(select_interface(&forward, &priority).unwrap().name, "enp1s0f1np1");
        assert_eq!(select_interface(&reverse, &priority).unwrap().name, "enp1s0f1np1");
    }

    #[test]
    fn test_down_interfaces_are_never_selected() {
        let priority = vec!["enp1s0f1np1".to_string()];
        let interfaces = vec![
            iface("enp1s0f1np1", "mlx5_1", LinkState::Down),
            iface("ib0", "mlx5_0", LinkState::Up),
        ];
        assert_eq!(select_interface(&interfaces, &priority).unwrap().name, "ib0");

        let all_down = vec![iface("enp1s0f1np1", "mlx5_1", LinkState::Down)];
        assert!(select_interface(&all_down, &priority).is_none());
    }

    #[test]
    fn test_build_interfaces_joins_addressing() {
        let mut host = HostAddressing::default();
        host.ipv4.insert("enp1s0f1np1".to_string(), Ipv4Addr::new(192, 168, 100, 10));
        host.speed_mbps.insert("enp1s0f1np1".to_string(), 200_000);

        let interfaces = build_interfaces(parse_ibdev2netdev(SPARK_OUTPUT), &host);
        let selected = &interfaces[1];
        assert_eq!(selected.address, Some(Ipv4Addr::new(192, 168, 100, 10)));
        assert_eq!(selected.link_speed_mbps, Some(200_000));
        assert!(interfaces[0].address.is_none());
    }

    #[test]
    fn test_fallback_selection_and_env() {
        let network = NetworkConfig::default();
        let selection = NetworkSelection::resolve(&[], &network, Some("10.0.0.5"));
        assert!(selection.fallback);
        assert_eq!(selection.interface, "enp1s0f1np1");
        assert_eq!(selection.hca, "mlx5_1");
        assert_eq!(selection.address.as_deref(), Some("10.0.0.5"));

        let env = selection.nccl_env();
        assert!(env.contains(&("NCCL_IB_HCA".to_string(), "mlx5_1".to_string())));
        assert!(env.contains(&("NCCL_IB_DISABLE".to_string(), "0".to_string())));
        assert_eq!(selection.speed_label(), "unknown");
    }

    #[test]
    fn test_default_address_prefers_fallback_interface() {
        let candidates = vec![
            ("lo".to_string(), Ipv4Addr::LOCALHOST),
            ("docker0".to_string(), Ipv4Addr::new(169, 254, 3, 1)),
            ("eth0".to_string(), Ipv4Addr::new(10, 1, 2, 3)),
            ("enp1s0f1np1".to_string(), Ipv4Addr::new(192, 168, 100, 10)),
        ];
        assert_eq!(
            pick_default_address(&candidates, "enp1s0f1np1"),
            Some(Ipv4Addr::new(192, 168, 100, 10))
        );
        assert_eq!(pick_default_address(&candidates, "ib0"), Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(pick_default_address(&candidates[..2], "ib0"), None);
    }

    #[tokio::test]
    async fn test_detect_without_rdma_tooling_is_empty() {
        let runner = Arc::new(ScriptedRunner::new().on_failure(
            "ibdev2netdev",
            ExecFailure::Spawn("No such file or directory (os error 2)".to_string()),
        ));
        let detector = NetworkDetector::new(runner.clone());

        let interfaces = detector.detect().await;
        assert!(interfaces.is_empty());
        assert_eq!(runner.calls().len(), 1);

        let selection = NetworkSelection::resolve(&interfaces, &NetworkConfig::default(), None);
        assert!(selection.fallback);
        assert!(selection.address.is_none());
    }

    #[tokio::test]
    async fn test_detect_joins_sysfs_speed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("enp1s0f1np1")).unwrap();
        std::fs::write(dir.path().join("enp1s0f1np1").join("speed"), "200000\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new().on("ibdev2netdev", 0, SPARK_OUTPUT));
        let detector = NetworkDetector::new(runner).with_sysfs_root(dir.path());

        let interfaces = detector.detect().await;
        assert_eq!(interfaces.len(), 4);
        assert_eq!(interfaces[1].link_speed_mbps, Some(200_000));
        assert_eq!(interfaces[0].link_speed_mbps, None);

        let selection = NetworkSelection::resolve(&interfaces, &NetworkConfig::default(), Some("10.0.0.5"));
        assert!(!selection.fallback);
        assert_eq!(selection.interface, "enp1s0f1np1");
        assert_eq!(selection.speed_label(), "200 Gb/s");
        assert_eq!(selection.address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_read_link_speed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("enp1s0f1np1")).unwrap();
        std::fs::write(dir.path().join("enp1s0f1np1").join("speed"), "200000\n").unwrap();
        std::fs::create_dir_all(dir.path().join("enp1s0f0np0")).unwrap();
        std::fs::write(dir.path().join("enp1s0f0np0").join("speed"), "-1\n").unwrap();

        assert_eq!(read_link_speed(dir.path(), "enp1s0f1np1"), Some(200_000));
        assert_eq!(read_link_speed(dir.path(), "enp1s0f0np0"), None);
        assert_eq!(read_link_speed(dir.path(), "missing"), None);
    }
}
