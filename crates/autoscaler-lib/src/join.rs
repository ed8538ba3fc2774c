//! Source of the cluster join command handed to new VMs

use crate::error::{Result, ScalerError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

/// Produces a fresh join command string
#[async_trait]
pub trait JoinCommandSource: Send + Sync {
    async fn join_command(&self) -> Result<String>;
}

/// Runs a shell command whose stdout is the join command
pub struct ShellJoinCommand {
    command: String,
}

impl ShellJoinCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JoinCommandSource for ShellJoinCommand {
    async fn join_command(&self) -> Result<String> {
        let output = Command::new("sh").arg("-c").arg(&self.command).output().await?;

        if !output.status.success() {
            return Err(ScalerError::Cluster(format!(
                "join command generator `{}` exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if command.is_empty() {
            return Err(ScalerError::Cluster(format!(
                "join command generator `{}` printed nothing",
                self.command
            )));
        }
        info!("Generated join command");
        Ok(command)
    }
}
