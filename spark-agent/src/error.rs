//! Error taxonomy for bring-up runs
//!
//! Configuration problems are fatal before anything runs; step and health-check
//! failures carry enough context (step, reason, last output) for an operator
//! to pick the next diagnostic command.

use crate::config::Role;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is required for the {role} role")]
    Missing { var: &'static str, role: Role },

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {}: {reason}", path.display())]
    File { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn invalid(var: impl Into<String>, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            var: var.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    pub fn hint(&self) -> String {
        match self {
            ConfigError::Missing { var, .. } => {
                format!("export {var}=<value> (or add it to .env) and re-run")
            }
            ConfigError::Invalid { var, .. } => format!("fix {var} and re-run `spark-agent config show`"),
            ConfigError::File { path, .. } => format!("check or delete {}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BringupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("step {ordinal} ({description}) failed: {reason}")]
    Step {
        ordinal: usize,
        description: String,
        reason: String,
        diagnostics: String,
        hint: String,
    },

    #[error("health check '{check}' not satisfied after {attempts} attempts: {last_observation}")]
    HealthCheck {
        check: String,
        attempts: u32,
        last_observation: String,
        hint: String,
    },

    #[error("bring-up aborted by operator before step {next_ordinal}")]
    Cancelled { next_ordinal: usize },
}

impl BringupError {
    /// Next command an operator should run to investigate this failure
    pub fn hint(&self) -> String {
        match self {
            BringupError::Config(e) => e.hint(),
            BringupError::Step { hint, .. } | BringupError::HealthCheck { hint, .. } => hint.clone(),
            BringupError::Cancelled { .. } => {
                "processes were left running; inspect with `spark-agent status` or tear down with `spark-agent down`"
                    .to_string()
            }
        }
    }

    /// Last captured command output, if any
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            BringupError::Step { diagnostics, .. } if !diagnostics.is_empty() => Some(diagnostics),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BringupError::Config(_) => 2,
            BringupError::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_peer_message_names_variable() {
        let err = BringupError::from(ConfigError::Missing {
            var: "HEAD_IP",
            role: Role::Worker,
        });
        assert!(err.to_string().contains("HEAD_IP is required for the worker role"));
        assert!(err.hint().contains("export HEAD_IP"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_step_error_carries_diagnostics() {
        let err = BringupError::Step {
            ordinal: 5,
            description: "Verify Ray version".into(),
            reason: "mismatch".into(),
            diagnostics: "ray, version 2.50.0".into(),
            hint: "docker logs ray-worker".into(),
        };
        assert_eq!(err.diagnostics(), Some("ray, version 2.50.0"));
        assert_eq!(err.hint(), "docker logs ray-worker");
        assert_eq!(err.exit_code(), 1);
    }
}
