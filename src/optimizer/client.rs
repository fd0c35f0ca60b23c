//! Optimizer backed by an external command.
//!
//! The request is written to the command's stdin as JSON and the response is
//! read from stdout as JSON. The coordinator bounds the call with a timeout;
//! the child is killed when the call is dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::{OptimizationRequest, OptimizationResponse, OptimizerClient};
use crate::config::OptimizerSettings;

/// Runs `command args...` once per optimization.
#[derive(Debug, Clone)]
pub struct CommandOptimizer {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandOptimizer {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Optimizer from settings, `None` when no command is configured.
    #[must_use]
    pub fn from_settings(settings: &OptimizerSettings) -> Option<Self> {
        settings
            .command
            .as_ref()
            .map(|command| Self::new(command).with_args(settings.args.clone()))
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Parse the optimizer's stdout. Leading log lines are tolerated: the
    /// last line that parses as a response wins.
    fn parse_response(stdout: &str) -> Result<OptimizationResponse> {
        if let Ok(response) = serde_json::from_str(stdout.trim()) {
            return Ok(response);
        }
        stdout
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .find_map(|line| serde_json::from_str(line.trim()).ok())
            .context("Optimizer output is not a valid response")
    }
}

#[async_trait]
impl OptimizerClient for CommandOptimizer {
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse> {
        let payload = serde_json::to_vec(request)?;
        debug!(
            "Running optimizer {} for task {} ({} bytes)",
            self.command,
            request.task.id,
            payload.len()
        );

        let mut command = AsyncCommand::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn optimizer '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write request to optimizer stdin")?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to read optimizer output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Optimizer exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Self::parse_response(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Stand-in used when no optimizer command is configured; every call fails
/// so triggered records end up `failed` with an explanation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledOptimizer;

#[async_trait]
impl OptimizerClient for DisabledOptimizer {
    async fn optimize(&self, _request: &OptimizationRequest) -> Result<OptimizationResponse> {
        anyhow::bail!("no optimizer command configured (set optimizer.command in settings)")
    }
}
