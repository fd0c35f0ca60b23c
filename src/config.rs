//! Monitor settings loaded from `.overseer/settings.json`.
//!
//! Everything here is optional; a project without a settings file runs with
//! [`MonitorSettings::default`]. Policy constants (degradation thresholds,
//! cooldowns, the apply quality bar) are deliberately not configurable and
//! live next to the code that enforces them.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "defaultStallThresholdSeconds": 600,
//!   "strategy": "timestamp",
//!   "optimizer": {
//!     "command": "agent-optimizer",
//!     "args": ["--json"],
//!     "maxIterations": 3,
//!     "timeoutSeconds": 120
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OverseerError, Result};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".overseer";

/// How sessions are classified as stalled on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionStrategy {
    /// Compare the backend's last-activity timestamp with the threshold.
    #[default]
    Timestamp,
    /// Hash captured terminal text and report sessions whose output has not
    /// changed for the threshold. Runs a capture per session per tick.
    ContentDiff,
}

/// External optimizer invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Executable receiving the request on stdin. `None` disables
    /// optimization (triggers still create records, which then fail).
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_max_iterations", rename = "maxIterations")]
    pub max_iterations: u32,

    /// Score the optimizer aims for. Independent of the apply bar.
    #[serde(default = "default_target_score", rename = "targetScore")]
    pub target_score: f64,

    #[serde(default = "default_timeout_seconds", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_target_score() -> f64 {
    0.9
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_stall_threshold() -> u64 {
    crate::scope::DEFAULT_STALL_THRESHOLD_SECS
}

fn default_true() -> bool {
    true
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            max_iterations: default_max_iterations(),
            target_score: default_target_score(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl OptimizerSettings {
    /// Upper bound for a single optimizer call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Validates the optimizer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `maxIterations` is zero
    /// - `targetScore` is not a finite number in `0.0..=1.0`
    /// - `timeoutSeconds` is zero
    /// - `command` is set but blank
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_iterations == 0 {
            return Err("optimizer.maxIterations must be at least 1".to_string());
        }
        if !self.target_score.is_finite() || !(0.0..=1.0).contains(&self.target_score) {
            return Err(format!(
                "optimizer.targetScore must be between 0 and 1, got {}",
                self.target_score
            ));
        }
        if self.timeout_seconds == 0 {
            return Err("optimizer.timeoutSeconds must be positive".to_string());
        }
        if self.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err("optimizer.command is empty".to_string());
        }
        Ok(())
    }
}

/// Project-level monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Threshold applied to scopes created without one.
    #[serde(
        default = "default_stall_threshold",
        rename = "defaultStallThresholdSeconds"
    )]
    pub default_stall_threshold_seconds: u64,

    /// Owner used by the CLI when `--owner` is not given.
    #[serde(default, rename = "defaultOwner")]
    pub default_owner: Option<String>,

    #[serde(default)]
    pub strategy: DetectionStrategy,

    #[serde(default)]
    pub optimizer: OptimizerSettings,

    /// Persist version stacks and optimization records under the data dir.
    #[serde(default = "default_true", rename = "persistHistory")]
    pub persist_history: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            default_stall_threshold_seconds: default_stall_threshold(),
            default_owner: None,
            strategy: DetectionStrategy::default(),
            optimizer: OptimizerSettings::default(),
            persist_history: true,
        }
    }
}

impl MonitorSettings {
    /// Load settings from a project directory, defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::Settings`] when the file exists but cannot
    /// be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            OverseerError::settings_with_path(format!("Failed to read settings: {e}"), path.clone())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            OverseerError::settings_with_path(format!("Failed to parse settings: {e}"), path)
        })
    }

    /// Load and validate in one step.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::InvalidSettings`] when validation fails.
    pub fn load_validated(project_dir: &Path) -> Result<Self> {
        let settings = Self::load(project_dir)?;
        settings
            .validate()
            .map_err(|reason| OverseerError::InvalidSettings { reason })?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_stall_threshold_seconds == 0 {
            return Err("defaultStallThresholdSeconds must be positive".to_string());
        }
        if self
            .default_owner
            .as_deref()
            .is_some_and(|o| o.trim().is_empty())
        {
            return Err("defaultOwner is empty".to_string());
        }
        self.optimizer.validate()
    }

    /// Get the data directory for a project
    pub fn data_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(DATA_DIR)
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join("settings.json")
    }

    /// Get the persisted scopes file
    pub fn scopes_path(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join(crate::scope::SCOPES_FILENAME)
    }

    /// Get the session table published by the terminal backend
    pub fn sessions_path(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join(crate::session::SESSIONS_FILENAME)
    }

    /// Get the directory of per-session version histories
    pub fn versions_dir(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join("versions")
    }

    /// Get the optimization journal
    pub fn optimizations_log(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join("optimizations.jsonl")
    }

    /// Get the directory of per-session analysis payloads
    pub fn analysis_dir(project_dir: &Path) -> PathBuf {
        Self::data_dir(project_dir).join("analysis")
    }
}
