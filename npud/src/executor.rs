//! Hardware reset execution.

use npu_common::config::HotResetConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Placeholder replaced by the device's logical id in command arguments.
pub const LOGIC_ID_PLACEHOLDER: &str = "{logic_id}";

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("reset command is empty")]
    EmptyCommand,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reset of device {logical_id} exited with {status}: {stderr}")]
    Failed {
        logical_id: i32,
        status: String,
        stderr: String,
    },

    #[error("reset of device {logical_id} timed out after {timeout:?}")]
    Timeout { logical_id: i32, timeout: Duration },

    #[error("reset of device {logical_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        logical_id: i32,
        attempts: u32,
        last_error: String,
    },
}

/// Performs the hardware reset of a single device.
pub trait ResetExecutor: Send + Sync {
    fn reset_device(&self, logical_id: i32) -> impl Future<Output = Result<(), ResetError>> + Send;
}

/// Runs an external command per device, with retries.
#[derive(Debug, Clone)]
pub struct CommandResetExecutor {
    command: Vec<String>,
    max_attempts: u32,
    retry_wait: Duration,
    attempt_timeout: Duration,
}

impl CommandResetExecutor {
    pub fn new(command: Vec<String>) -> Self {
        let defaults = HotResetConfig::default();
        Self {
            command,
            max_attempts: defaults.max_attempts,
            retry_wait: Duration::from_secs(defaults.retry_wait_secs),
            attempt_timeout: Duration::from_secs(defaults.attempt_timeout_secs),
        }
    }

    pub fn from_config(config: &HotResetConfig) -> Self {
        Self {
            command: config.reset_command.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_wait: Duration::from_secs(config.retry_wait_secs),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn build_command(&self, logical_id: i32) -> Result<Command, ResetError> {
        let (program, args) = self.command.split_first().ok_or(ResetError::EmptyCommand)?;
        let id = logical_id.to_string();
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|arg| arg.replace(LOGIC_ID_PLACEHOLDER, &id)));
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn attempt(&self, logical_id: i32) -> Result<(), ResetError> {
        let mut cmd = self.build_command(logical_id)?;
        let program = self.command.first().cloned().unwrap_or_default();
        let output = match tokio::time::timeout(self.attempt_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| ResetError::Spawn { program, source })?,
            Err(_) => {
                return Err(ResetError::Timeout {
                    logical_id,
                    timeout: self.attempt_timeout,
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }
        Err(ResetError::Failed {
            logical_id,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl ResetExecutor for CommandResetExecutor {
    async fn reset_device(&self, logical_id: i32) -> Result<(), ResetError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.attempt(logical_id).await {
                Ok(()) => {
                    info!(logical_id, attempt, "device reset succeeded");
                    return Ok(());
                }
                Err(e @ (ResetError::EmptyCommand | ResetError::Spawn { .. })) => return Err(e),
                Err(e) => {
                    warn!(logical_id, attempt, error = %e, "device reset attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < self.max_attempts {
                debug!(logical_id, wait = ?self.retry_wait, "waiting before next reset attempt");
                tokio::time::sleep(self.retry_wait).await;
            }
        }
        Err(ResetError::Exhausted {
            logical_id,
            attempts: self.max_attempts,
            last_error,
        })
    }
}
