//! Explicit teardown (`spark-agent down`)
//!
//! Bring-up never cleans up after itself; this is the only path that stops
//! the server, leaves Ray and removes the node container.

use crate::config::{ClusterConfig, Role};
use crate::docker::{ContainerState, Docker};
use crate::execution::CommandRunner;
use crate::health::pgrep_pattern;
use crate::inference::SERVER_PROCESS_PATTERN;
use crate::ray;
use std::sync::Arc;
use tracing::{info, warn};

/// What an explicit teardown did, in order
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub actions: Vec<String>,
    pub warnings: Vec<String>,
}

/// Stop the server, leave the Ray cluster and remove the node container
pub async fn teardown(
    role: Role,
    config: &ClusterConfig,
    runner: Arc<dyn CommandRunner>,
    keep_container: bool,
) -> TeardownReport {
    let docker = Docker::new(runner, config.timeouts.command);
    let container = config.container_name(role);
    let timeout = config.timeouts.command;
    let mut report = TeardownReport::default();

    match docker.state(&container).await {
        ContainerState::Missing => {
            report.actions.push(format!("container {} not present", container));
            return report;
        }
        ContainerState::Unknown(reason) => {
            report.warnings.push(format!("docker inspect {}: {}", container, reason));
            warn!("⚠️ cannot determine state of {}: {}", container, reason);
            return report;
        }
        ContainerState::Stopped(status) => {
            report.actions.push(format!("container {} already {}", container, status));
        }
        ContainerState::Running => {
            if role == Role::Coordinator {
                let kill = format!("pkill -f {}", shell_words::quote(&pgrep_pattern(SERVER_PROCESS_PATTERN)));
                let result = docker.exec(&container, &kill, &[], timeout).await;
                // pkill exits 1 when nothing matched
                match result.exit_code {
                    Some(0) => report.actions.push("stopped inference server".to_string()),
                    Some(1) => report.actions.push("no inference server running".to_string()),
                    _ => report
                        .warnings
                        .push(format!("stopping inference server: {}", result.status_label())),
                }
            }

            let stop = docker.exec(&container, ray::stop_script(), &[], timeout).await;
            if stop.success() {
                report.actions.push("stopped Ray".to_string());
            } else {
                report.warnings.push(format!("ray stop: {}", stop.tail(3)));
            }
        }
    }

    if keep_container {
        report.actions.push(format!("kept container {}", container));
    } else {
        let removed = docker.remove(&container).await;
        if removed.success() {
            report.actions.push(format!("removed container {}", container));
        } else {
            report
                .warnings
                .push(format!("docker rm -f {}: {}", container, removed.tail(3)));
        }
    }

    for action in &report.actions {
        info!("{}", action);
    }
    for warning in &report.warnings {
        warn!("⚠️ {}", warning);
    }
    report
}
