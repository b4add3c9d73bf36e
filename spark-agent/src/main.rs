//! Spark Cluster Agent
//!
//! Brings up a two-node vLLM / Ray cluster on DGX Spark hosts:
//! - Coordinator and worker bring-up as ordered, idempotent steps
//! - Cluster health polling with bounded attempts
//! - Local and remote diagnostics reports
//! - Inference smoke tests and a concurrent benchmark

use clap::Parser;
use spark_agent::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
