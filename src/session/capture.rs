//! Scrollback capture through tmux.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::DiagnosticCapture;

/// Default number of scrollback lines to capture.
pub const DEFAULT_CAPTURE_LINES: u32 = 2000;

/// Captures pane text with `tmux capture-pane -p`.
#[derive(Debug, Clone)]
pub struct TmuxCapture {
    binary: String,
    lines: u32,
}

impl Default for TmuxCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxCapture {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
            lines: DEFAULT_CAPTURE_LINES,
        }
    }

    /// Number of scrollback lines to include.
    #[must_use]
    pub fn with_lines(mut self, lines: u32) -> Self {
        self.lines = lines;
        self
    }

    /// Use a different tmux binary (alternate sockets, wrappers).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn args(&self, terminal_ref: &str) -> Vec<String> {
        vec![
            "capture-pane".to_string(),
            "-p".to_string(),
            "-J".to_string(),
            "-t".to_string(),
            terminal_ref.to_string(),
            "-S".to_string(),
            format!("-{}", self.lines),
        ]
    }
}

#[async_trait]
impl DiagnosticCapture for TmuxCapture {
    async fn capture_text(&self, terminal_ref: &str) -> Result<Option<String>> {
        debug!("Capturing {} lines from {}", self.lines, terminal_ref);

        let output = AsyncCommand::new(&self.binary)
            .args(self.args(terminal_ref))
            .output()
            .await
            .with_context(|| format!("Failed to execute {} capture-pane", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("can't find") || stderr.contains("no server running") {
                return Ok(None);
            }
            anyhow::bail!("capture-pane failed for {}: {}", terminal_ref, stderr.trim());
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_args() {
        let capture = TmuxCapture::new().with_lines(50);
        assert_eq!(
            capture.args("work:1"),
            vec!["capture-pane", "-p", "-J", "-t", "work:1", "-S", "-50"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let capture = TmuxCapture::new().with_binary("definitely-not-a-tmux-binary-xyz");
        assert!(capture.capture_text("any").await.is_err());
    }
}
