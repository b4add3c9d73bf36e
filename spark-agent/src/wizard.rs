//! Interactive wizard for invocation without arguments
//!
//! Shows what the node looks like (GPUs, RDMA links), asks which action to
//! take with the values it needs, optionally saves them, and hands the
//! resulting command back to the CLI.

use crate::capabilities::CapabilityDetector;
use crate::cli::Command;
use crate::config::{ClusterConfig, Role};
use crate::discovery::NetworkDetector;
use crate::execution::SystemRunner;
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::Arc;

const ACTIONS: &[(&str, &str)] = &[
    ("up", "Bring up this node (coordinator or worker)"),
    ("status", "One-shot cluster health"),
    ("diagnose", "Collect a diagnostics report"),
    ("bench", "Concurrent inference benchmark"),
    ("detect", "Show RDMA interfaces and NCCL environment"),
    ("down", "Tear down this node"),
    ("quit", "Exit"),
];

pub struct SetupWizard;

impl SetupWizard {
    /// Returns the chosen command, or None when the operator quits
    pub async fn run(config: &mut ClusterConfig) -> Result<Option<Command>> {
        println!();
        println!("⚡ ======================================");
        println!("   SPARK CLUSTER AGENT");
        println!("⚡ ======================================");
        println!();

        Self::display_node_info().await;

        let action = Self::prompt_with_options("Action", ACTIONS, "status")?;
        let command = match action.as_str() {
            "up" => {
                let role = Self::prompt_role()?;
                Self::configure_up(config, role)?;
                Command::Up {
                    role,
                    skip_pull: !Self::prompt_yes_no("Pull the container image?", !config.container.skip_pull)?,
                    skip_download: false,
                    head_ip: None,
                    model: None,
                }
            }
            "down" => Command::Down {
                role: Self::prompt_role()?,
                keep_container: !Self::prompt_yes_no("Remove the container?", true)?,
            },
            "status" => Command::Status,
            "diagnose" => Command::Diagnose {
                quick: Self::prompt_yes_no("Quick check only?", true)?,
                full: false,
                remote: Self::prompt_optional("Remote hosts (comma separated, empty for none)")?
                    .map(|hosts| hosts.split(',').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
                    .unwrap_or_default(),
                output: ".".into(),
                json: false,
            },
            "bench" => Command::Bench {
                concurrency: Self::prompt_with_default_parse("Concurrent requests", "5")?,
                max_tokens: Self::prompt_with_default_parse("Max tokens per request", "256")?,
                prompt: None,
                timeout: std::time::Duration::from_secs(300),
            },
            "detect" => Command::Detect {
                role: Self::prompt_role()?,
            },
            _ => {
                println!("👋 Bye.");
                return Ok(None);
            }
        };

        if action == "up" && Self::prompt_yes_no("💾 Save these settings as defaults?", false)? {
            let path = config.save().await.context("Failed to save configuration")?;
            println!("✅ Configuration saved to {}", path.display());
        }
        println!();

        Ok(Some(command))
    }

    async fn display_node_info() {
        println!("📋 NODE INFORMATION");
        println!("────────────────────────────────────────");

        let runner = Arc::new(SystemRunner);
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        println!("🖥️  Hostname: {}", hostname);

        let gpus = CapabilityDetector::new(runner.as_ref()).gpus().await;
        if gpus.is_empty() {
            println!("🎮 GPUs: none detected");
        } else {
            println!("🎮 GPUs: {}", gpus.join(", "));
        }

        let interfaces = NetworkDetector::new(runner).detect().await;
        if interfaces.is_empty() {
            println!("🌐 RDMA: no interfaces (ibdev2netdev unavailable)");
        }
        for iface in interfaces {
            println!(
                "🌐 {} ({}): {} {}",
                iface.name,
                iface.hca,
                iface.link_state,
                iface.address.map(|a| a.to_string()).unwrap_or_default()
            );
        }
        println!();
    }

    fn prompt_role() -> Result<Role> {
        let role = Self::prompt_with_options(
            "Role",
            &[
                ("coordinator", "Ray head + inference server"),
                ("worker", "Joins an existing coordinator"),
            ],
            "coordinator",
        )?;
        Ok(if role == "worker" { Role::Worker } else { Role::Coordinator })
    }

    fn configure_up(config: &mut ClusterConfig, role: Role) -> Result<()> {
        println!("🚀 BRING-UP SETTINGS");
        println!("────────────────────────────────────────");

        let head_ip = config.node.head_ip.clone().unwrap_or_default();
        config.node.head_ip = match role {
            Role::Worker => loop {
                let value = Self::prompt_with_default("Coordinator IP (HEAD_IP)", &head_ip)?;
                if !value.is_empty() {
                    break Some(value);
                }
                println!("❌ A worker needs the coordinator address.");
            },
            Role::Coordinator => {
                Self::prompt_optional(&format!("This node's IP (empty to auto-detect) [{}]", head_ip))?
                    .or(config.node.head_ip.clone())
            }
        };

        if role == Role::Coordinator {
            config.serve.model = Self::prompt_with_default("Model", &config.serve.model)?;
            config.serve.tensor_parallel =
                Self::prompt_with_default_parse("Tensor parallel size", &config.serve.tensor_parallel.to_string())?;
            config.serve.max_model_len =
                Self::prompt_with_default_parse("Max model length", &config.serve.max_model_len.to_string())?;
        }
        config.ray.version = Self::prompt_with_default("Ray version (must match on all nodes)", &config.ray.version)?;
        println!();
        Ok(())
    }

    fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
        print!("❓ {} [{}]: ", prompt, default);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        if input.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(input.to_string())
        }
    }

    fn prompt_with_default_parse<T: std::str::FromStr>(prompt: &str, default: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        loop {
            let input = Self::prompt_with_default(prompt, default)?;
            match input.parse::<T>() {
                Ok(value) => return Ok(value),
                Err(e) => println!("❌ Invalid input: {}. Please try again.", e),
            }
        }
    }

    pub fn prompt_optional(prompt: &str) -> Result<Option<String>> {
        print!("❓ {}: ", prompt);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        if input.is_empty() {
            Ok(None)
        } else {
            Ok(Some(input.to_string()))
        }
    }

    fn prompt_yes_no(prompt: &str, default: bool) -> Result<bool> {
        let default_str = if default { "Y/n" } else { "y/N" };

        loop {
            print!("❓ {} [{}]: ", prompt, default_str);
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            match parse_yes_no(&input, default) {
                Some(answer) => return Ok(answer),
                None => println!("❌ Please enter 'y' or 'n'."),
            }
        }
    }

    fn prompt_with_options(prompt: &str, options: &[(&str, &str)], default: &str) -> Result<String> {
        println!("❓ {}:", prompt);
        for (key, description) in options {
            let marker = if *key == default { "►" } else { " " };
            println!("  {} {} - {}", marker, key, description);
        }

        loop {
            print!("Choice [{}]: ", default);
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if let Some(choice) = parse_choice(&input, options, default) {
                return Ok(choice);
            }
            println!("❌ Invalid choice. Please select from the available options.");
        }
    }
}

fn parse_yes_no(input: &str, default: bool) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

fn parse_choice(input: &str, options: &[(&str, &str)], default: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return Some(default.to_string());
    }
    options
        .iter()
        .find(|(key, _)| *key == input)
        .map(|(key, _)| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yes_no() {
        assert_eq!(parse_yes_no("\n", true), Some(true));
        assert_eq!(parse_yes_no("No\n", true), Some(false));
        assert_eq!(parse_yes_no("maybe", false), None);
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("\n", ACTIONS, "status").as_deref(), Some("status"));
        assert_eq!(parse_choice("diagnose\n", ACTIONS, "status").as_deref(), Some("diagnose"));
        assert_eq!(parse_choice("reboot", ACTIONS, "status"), None);
    }
}
