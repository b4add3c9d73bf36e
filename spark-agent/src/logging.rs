//! Tracing setup: stderr plus an optional timestamped log file
//!
//! `RUST_LOG` controls levels (default `spark_agent=info`, `debug` with
//! `--verbose`). Long-running commands also write a plain-text copy to
//! `<prefix>_<YYYYmmdd_HHMMSS>.log` in the working directory.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn log_file_name(prefix: &str) -> String {
    format!("{}_{}.log", prefix, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Install the global subscriber; returns the log file path when one was opened
pub fn init(verbose: bool, file_prefix: Option<&str>) -> Result<Option<PathBuf>> {
    let default_level = if verbose { "spark_agent=debug" } else { "spark_agent=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, path) = match file_prefix {
        Some(prefix) => {
            let path = PathBuf::from(log_file_name(prefix));
            let file = File::create(&path).with_context(|| format!("Failed to create log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Arc::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let name = log_file_name("spark-agent_worker");
        assert!(name.starts_with("spark-agent_worker_"));
        assert!(name.ends_with(".log"));
        // prefix + '_' + YYYYmmdd_HHMMSS + ".log"
        assert_eq!(name.len(), "spark-agent_worker_".len() + 15 + 4);
    }
}
