//! Spark Agent - two-node vLLM / Ray cluster bring-up over RDMA
//!
//! This crate provides the node-side tooling for a coordinator + worker cluster:
//! - RDMA network interface detection (`discovery`)
//! - Staged, verified container / Ray / vLLM bring-up (`bringup`)
//! - Bounded health polling with composite probes (`health`)
//! - Failure-isolated local and remote diagnostics (`diagnostics`)
//! - Concurrent chat-completions benchmark (`benchmark`)

pub mod benchmark;
pub mod bringup;
pub mod capabilities;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod execution;
pub mod health;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod ray;
pub mod wizard;

pub use bringup::{bring_up, BringupRun, NodeBringupSequencer, NodeHandle, NodeStatus, RunState};
pub use config::{ClusterConfig, Role};
pub use diagnostics::{DiagnosticCollector, DiagnosticReport, SectionStatus};
pub use discovery::{NetworkDetector, NetworkInterface, NetworkSelection};
pub use error::{BringupError, ConfigError};
pub use execution::{CommandRunner, CommandSpec, ExecutionResult, SystemRunner};
pub use health::{ClusterHealthPoller, HealthCheck, PollOutcome, Probe};
