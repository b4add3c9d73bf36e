//! Command-line surface and dispatch
//!
//! Every subcommand returns the process exit status: 0 on success, the number
//! of failed sections for `diagnose`, and the error's own code for `up`.

use crate::benchmark::{self, BenchmarkRequest, BenchmarkSummary};
use crate::bringup::{self, RunState, StepRecord, StepStatus};
use crate::config::{ClusterConfig, Role};
use crate::diagnostics::{full_sections, quick_sections, DiagnosticCollector};
use crate::discovery::{default_node_address, NetworkDetector, NetworkInterface, NetworkSelection};
use crate::docker::{ContainerState, Docker};
use crate::execution::{CommandRunner, SshTarget, SystemRunner};
use crate::inference::{ChatMessage, ChatRequest, InferenceClient};
use crate::logging;
use crate::ray;
use crate::wizard::SetupWizard;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_BENCH_PROMPT: &str = "Write a short story about a robot learning to paint.";

#[derive(Parser, Debug)]
#[command(name = "spark-agent", version, about = "Two-node vLLM / Ray cluster bring-up, health and diagnostics")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Bring up this node
    Up {
        #[arg(long, value_enum, env = "SPARK_ROLE")]
        role: Role,
        /// Use the local image without pulling
        #[arg(long)]
        skip_pull: bool,
        /// Assume the model is already in the HF cache
        #[arg(long)]
        skip_download: bool,
        /// Coordinator address (overrides HEAD_IP)
        #[arg(long)]
        head_ip: Option<String>,
        /// Model to serve (overrides MODEL)
        #[arg(long)]
        model: Option<String>,
    },
    /// Stop the server, leave Ray and remove the node container
    Down {
        #[arg(long, value_enum, env = "SPARK_ROLE")]
        role: Role,
        #[arg(long)]
        keep_container: bool,
    },
    /// One-shot cluster health
    Status,
    /// Show RDMA interfaces and the derived NCCL environment
    Detect {
        /// Whose configured address to show (HEAD_IP or WORKER_IP)
        #[arg(long, value_enum, env = "SPARK_ROLE", default_value = "coordinator")]
        role: Role,
    },
    /// Collect a diagnostics report; exit status is the number of failed sections
    Diagnose {
        #[arg(long, conflicts_with = "full")]
        quick: bool,
        #[arg(long)]
        full: bool,
        /// Remote hosts to probe over ssh (overrides REMOTE_HOSTS)
        #[arg(long, value_delimiter = ',')]
        remote: Vec<String>,
        /// Directory for the .log / .json report files
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Print the JSON report instead of text
        #[arg(long)]
        json: bool,
    },
    /// Concurrent chat-completion benchmark
    Bench {
        #[arg(long, default_value_t = 5)]
        concurrency: usize,
        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
        #[arg(long)]
        prompt: Option<String>,
        /// Per-request timeout ("90s", "5m")
        #[arg(long, default_value = "300s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Send one chat request and show the answer and token usage
    Chat {
        prompt: String,
        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
    },
    /// Show configuration or store the model-hub token
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    Show,
    /// Store HF_TOKEN in the OS keyring
    SetToken { token: Option<String> },
}

impl Command {
    /// Prefix of the timestamped log file, for commands that keep one
    fn log_prefix(&self) -> Option<String> {
        match self {
            Command::Up { role, .. } => Some(format!("spark-agent_{}", role)),
            Command::Diagnose { .. } => Some("spark-agent_diagnose".to_string()),
            Command::Bench { .. } => Some("spark-agent_bench".to_string()),
            _ => None,
        }
    }
}

/// Parse-independent entry point used by `main`
pub async fn run(cli: Cli) -> Result<i32> {
    let mut config = match ClusterConfig::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("👉 {}", e.hint());
            return Ok(2);
        }
    };

    let command = match cli.command {
        Some(command) => command,
        None => match SetupWizard::run(&mut config).await? {
            Some(command) => command,
            None => return Ok(0),
        },
    };

    let log_path = logging::init(cli.verbose, command.log_prefix().as_deref())?;
    if let Some(path) = &log_path {
        info!("Logging to {}", path.display());
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    match command {
        Command::Up {
            role,
            skip_pull,
            skip_download,
            head_ip,
            model,
        } => {
            config.container.skip_pull |= skip_pull;
            config.serve.skip_download |= skip_download;
            if head_ip.is_some() {
                config.node.head_ip = head_ip;
            }
            if let Some(model) = model {
                config.serve.model = model;
            }
            Ok(up(role, config, runner).await)
        }
        Command::Down { role, keep_container } => {
            let report = bringup::teardown(role, &config, runner, keep_container).await;
            for action in &report.actions {
                println!("✅ {}", action);
            }
            for warning in &report.warnings {
                println!("⚠️ {}", warning);
            }
            Ok(if report.warnings.is_empty() { 0 } else { 1 })
        }
        Command::Status => status(&config, runner).await,
        Command::Detect { role } => {
            detect(&config, role, runner).await;
            Ok(0)
        }
        Command::Diagnose {
            quick,
            full: _,
            remote,
            output,
            json,
        } => diagnose(&config, runner, quick, remote, &output, json).await,
        Command::Bench {
            concurrency,
            max_tokens,
            prompt,
            timeout,
        } => bench(&config, concurrency, max_tokens, prompt, timeout).await,
        Command::Chat { prompt, max_tokens } => chat(&config, &prompt, max_tokens).await,
        Command::Config { action } => config_command(&config, action),
    }
}

/// Ctrl-C stops new steps and polls; running processes are left alone
fn abort_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️ Abort requested: finishing the current command, no new steps will start");
            token.cancel();
        }
    });
    cancel
}

async fn up(role: Role, config: ClusterConfig, runner: Arc<dyn CommandRunner>) -> i32 {
    println!("🚀 Bringing up {} node", role);
    let serve_url = config.serve_url();
    let run = bringup::bring_up(role, config, runner, abort_on_ctrl_c()).await;

    print_report(&run.records, run.state);

    match run.result {
        Ok(handle) if handle.is_ready() => {
            println!();
            println!("✅ {} READY: container {} at {}", role, handle.container, handle.address);
            println!(
                "   {} GPU(s) on {}",
                handle.capabilities.gpu_count, handle.capabilities.hostname
            );
            if role == Role::Coordinator {
                println!("   API: {}/v1/chat/completions", serve_url);
                println!("   Try: spark-agent chat \"Hello\"");
            }
            0
        }
        Ok(handle) => {
            println!();
            println!(
                "⚠️ {} started but cluster membership was not confirmed (container {})",
                role, handle.container
            );
            println!("👉 Next: docker exec {} ray status", handle.container);
            1
        }
        Err(e) => {
            println!();
            println!("❌ {}", e);
            if let Some(output) = e.diagnostics() {
                println!("── last output ──────────────────────────");
                println!("{}", output);
            }
            println!("👉 Next: {}", e.hint());
            e.exit_code()
        }
    }
}

fn print_report(records: &[StepRecord], state: RunState) {
    if records.is_empty() {
        return;
    }
    println!();
    println!("📋 BRING-UP REPORT ({})", state);
    println!("────────────────────────────────────────");
    for record in records {
        let (marker, detail) = match &record.status {
            StepStatus::Done => ("✅", String::new()),
            StepStatus::AlreadySatisfied => ("✅", " (already satisfied)".to_string()),
            StepStatus::Tolerated(reason) => ("⚠️", format!(" (tolerated: {})", reason)),
            StepStatus::Failed(reason) => ("❌", format!(" ({})", reason)),
            StepStatus::Cancelled => ("⏹️", " (aborted)".to_string()),
        };
        println!(
            "{} {:>2}. {:<40} {:.1?}{}",
            marker, record.ordinal, record.description, record.duration, detail
        );
    }
}

async fn status(config: &ClusterConfig, runner: Arc<dyn CommandRunner>) -> Result<i32> {
    let docker = Docker::new(runner, config.timeouts.command);
    let mut running = None;

    println!("📊 CLUSTER STATUS");
    println!("────────────────────────────────────────");
    for role in [Role::Coordinator, Role::Worker] {
        let name = config.container_name(role);
        let state = docker.state(&name).await;
        println!("🐳 {:<12} {}", name, state);
        if state == ContainerState::Running && running.is_none() {
            running = Some(name);
        }
    }

    if let Some(container) = &running {
        let result = docker
            .exec(container, ray::status_script(), &[], config.timeouts.command)
            .await;
        if result.success() {
            let ray_status = ray::parse_ray_status(&result.stdout);
            println!(
                "🔗 Ray: {}/{} active node(s), {} pending",
                ray_status.active_nodes.len(),
                config.node.expected_nodes,
                ray_status.pending_nodes_count
            );
        } else {
            println!("🔗 Ray: not running ({})", result.status_label());
        }
    }

    let client = InferenceClient::new(&config.serve_url(), config.timeouts.http)?;
    let healthy = match client.health().await {
        Ok(200) => {
            let model = client.model_id().await.ok().flatten().unwrap_or_else(|| "unknown".to_string());
            println!("🤖 Server: healthy at {} serving {}", client.base_url(), model);
            true
        }
        Ok(code) => {
            println!("🤖 Server: {} answered {}", client.base_url(), code);
            false
        }
        Err(e) => {
            println!("🤖 Server: unreachable at {} ({:#})", client.base_url(), e);
            false
        }
    };

    Ok(if healthy { 0 } else { 1 })
}

/// Selection as bring-up would make it for `role`
fn detect_selection(config: &ClusterConfig, role: Role, interfaces: &[NetworkInterface]) -> NetworkSelection {
    NetworkSelection::resolve(interfaces, &config.network, config.configured_address(role))
}

async fn detect(config: &ClusterConfig, role: Role, runner: Arc<dyn CommandRunner>) {
    let interfaces = NetworkDetector::new(runner).detect().await;

    println!("🌐 RDMA INTERFACES");
    println!("────────────────────────────────────────");
    if interfaces.is_empty() {
        println!("(none detected)");
    }
    for iface in &interfaces {
        println!(
            "{:<16} {:<8} port {} {:<5} {:<16} {}",
            iface.name,
            iface.hca,
            iface.port,
            iface.link_state.to_string(),
            iface.address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            iface
                .link_speed_mbps
                .map(|s| format!("{} Mb/s", s))
                .unwrap_or_else(|| "-".to_string())
        );
    }

    let selection = detect_selection(config, role, &interfaces);
    println!();
    println!(
        "Selected: {} ({}){}, {}",
        selection.interface,
        selection.hca,
        if selection.fallback { " [fallback]" } else { "" },
        selection.speed_label()
    );
    match &selection.address {
        Some(address) => println!("Address:  {} ({})", address, role),
        None => println!(
            "Address:  {} ({}, default; set {} to override)",
            default_node_address(&selection.interface),
            role,
            if role == Role::Worker { "WORKER_IP" } else { "HEAD_IP" }
        ),
    }
    println!();
    for (key, value) in selection.nccl_env() {
        println!("export {}={}", key, value);
    }
}

async fn diagnose(
    config: &ClusterConfig,
    runner: Arc<dyn CommandRunner>,
    quick: bool,
    remote: Vec<String>,
    output: &std::path::Path,
    json: bool,
) -> Result<i32> {
    let sections = if quick {
        quick_sections(config)
    } else {
        full_sections(config)
    };
    let targets: Vec<SshTarget> = if remote.is_empty() {
        config.remote_targets()
    } else {
        remote
            .iter()
            .map(|host| SshTarget {
                host: host.clone(),
                user: config.diagnostics.ssh_user.clone(),
                connect_timeout: config.diagnostics.remote_timeout,
            })
            .collect()
    };

    let collector = DiagnosticCollector::new(
        runner,
        config.diagnostics.section_timeout,
        config.diagnostics.remote_timeout,
    );
    let report = collector.collect(&sections, &targets).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_text());
    }

    let (text_path, json_path) = report.write_to(output).await?;
    info!("Report written to {} and {}", text_path.display(), json_path.display());

    let issues = report.issue_count();
    if issues > 0 {
        eprintln!("❌ {} issue(s) found", issues);
    } else {
        eprintln!("✅ No issues found");
    }
    Ok(issues.min(255) as i32)
}

async fn bench(
    config: &ClusterConfig,
    concurrency: usize,
    max_tokens: u32,
    prompt: Option<String>,
    timeout: Duration,
) -> Result<i32> {
    let client = InferenceClient::new(&config.serve_url(), timeout)?;
    // Prefer the id the server reports; it may differ from the configured one
    let model = match client.model_id().await {
        Ok(Some(id)) => id,
        _ => config.serve.model.clone(),
    };

    let request = BenchmarkRequest {
        model,
        prompt: prompt.unwrap_or_else(|| DEFAULT_BENCH_PROMPT.to_string()),
        max_tokens,
        temperature: 0.7,
        timeout,
    };
    let summary = benchmark::run_concurrent(&client, &request, concurrency).await;
    print_benchmark(&summary);

    Ok(if summary.failures == 0 { 0 } else { 1 })
}

fn print_benchmark(summary: &BenchmarkSummary) {
    println!();
    println!("📈 BENCHMARK");
    println!("────────────────────────────────────────");
    for result in &summary.results {
        match &result.error {
            None => println!(
                "✅ #{:<3} {:>6} tokens in {:.2?}",
                result.index, result.completion_tokens, result.latency
            ),
            Some(e) => println!("❌ #{:<3} failed after {:.2?}: {}", result.index, result.latency, e),
        }
    }
    println!();
    println!("Requests:   {} ok, {} failed", summary.successes, summary.failures);
    println!("Tokens:     {}", summary.total_completion_tokens);
    println!("Wall clock: {:.2?}", summary.wall_clock);
    println!("Throughput: {:.1} tokens/s", summary.throughput_tokens_per_sec);
    if let Some(latency) = summary.mean_latency {
        println!("Mean latency: {:.2?}", latency);
    }
}

async fn chat(config: &ClusterConfig, prompt: &str, max_tokens: u32) -> Result<i32> {
    let client = InferenceClient::new(&config.serve_url(), Duration::from_secs(300))?;
    let model = client
        .model_id()
        .await
        .context("Server is not answering /v1/models")?
        .unwrap_or_else(|| config.serve.model.clone());

    let response = client
        .chat(&ChatRequest {
            model: model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens,
            temperature: 0.7,
        })
        .await?;

    println!("🤖 {}", model);
    if let Some(reasoning) = response.reasoning() {
        println!("── reasoning ────────────────────────────");
        println!("{}", reasoning.trim());
    }
    println!("── answer ───────────────────────────────");
    let content = response.choices.first().and_then(|c| c.message.content.as_deref());
    println!("{}", content.unwrap_or("(no content; see reasoning above)").trim());

    if let Some(usage) = &response.usage {
        println!();
        println!(
            "Tokens: {} prompt + {} completion = {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
    }
    Ok(0)
}

fn config_command(config: &ClusterConfig, action: ConfigAction) -> Result<i32> {
    match action {
        ConfigAction::Show => {
            if let Some(path) = ClusterConfig::config_file_path() {
                println!("# {}", path.display());
            }
            println!("{}", toml::to_string_pretty(config)?);
            println!(
                "# HF_TOKEN: {}",
                if config.serve.hf_token.is_some() { "set" } else { "not set" }
            );
        }
        ConfigAction::SetToken { token } => {
            let token = match token {
                Some(token) => Some(token),
                None => SetupWizard::prompt_optional("HF token")?,
            };
            match token {
                Some(token) => {
                    ClusterConfig::save_token(&token).context("Failed to store token in the OS keyring")?;
                    println!("✅ Token stored in the OS keyring");
                }
                None => {
                    println!("❌ No token given");
                    return Ok(1);
                }
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up() {
        let cli = Cli::try_parse_from(["spark-agent", "up", "--role", "worker", "--head-ip", "10.0.0.1"]).unwrap();
        match cli.command {
            Some(Command::Up { role, head_ip, .. }) => {
                assert_eq!(role, Role::Worker);
                assert_eq!(head_ip.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_diagnose() {
        let cli = Cli::try_parse_from(["spark-agent", "diagnose", "--quick", "--remote", "spark-a,spark-b", "--json"]).unwrap();
        match cli.command {
            Some(Command::Diagnose { quick, remote, json, .. }) => {
                assert!(quick);
                assert!(json);
                assert_eq!(remote, vec!["spark-a", "spark-b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["spark-agent", "diagnose", "--quick", "--full"]).is_err());
    }

    #[test]
    fn test_bench_timeout_parses_human_duration() {
        let cli = Cli::try_parse_from(["spark-agent", "bench", "--timeout", "90s"]).unwrap();
        match cli.command {
            Some(Command::Bench { timeout, concurrency, .. }) => {
                assert_eq!(timeout, Duration::from_secs(90));
                assert_eq!(concurrency, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_detect_shows_the_role_address() {
        let mut config = ClusterConfig::default();
        config.node.head_ip = Some("10.0.0.1".to_string());
        config.node.worker_ip = Some("10.0.0.2".to_string());

        let worker = detect_selection(&config, Role::Worker, &[]);
        assert_eq!(worker.address.as_deref(), Some("10.0.0.2"));
        let coordinator = detect_selection(&config, Role::Coordinator, &[]);
        assert_eq!(coordinator.address.as_deref(), Some("10.0.0.1"));

        let cli = Cli::try_parse_from(["spark-agent", "detect", "--role", "worker"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Detect { role: Role::Worker })));
    }

    #[test]
    fn test_log_prefix() {
        let up = Command::Up {
            role: Role::Coordinator,
            skip_pull: false,
            skip_download: false,
            head_ip: None,
            model: None,
        };
        assert_eq!(up.log_prefix().as_deref(), Some("spark-agent_coordinator"));
        assert!(Command::Status.log_prefix().is_none());
    }
}
