//! External configuration optimization.
//!
//! The optimizer itself is opaque: it receives a task description, project
//! context and a budget, and answers with a score and possibly a new agent
//! configuration. This module defines that exchange, the lifecycle record of
//! one optimization attempt, and the [`OptimizationCoordinator`] that decides
//! when to ask for one.
//!
//! # Record lifecycle
//!
//! ```text
//! pending -> running -> completed
//!    |          |
//!    +----------+-----> failed
//! ```
//!
//! Cancellation is only possible from `pending` or `running` and always ends
//! in `failed` with the error "cancelled".

pub mod client;
pub mod coordinator;
pub mod journal;

pub use client::{CommandOptimizer, DisabledOptimizer};
pub use coordinator::{OptimizationCoordinator, APPLY_SCORE_THRESHOLD};
pub use journal::OptimizationJournal;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::OptimizerSettings;
use crate::error::OverseerError;

// ============================================================================
// Optimizer exchange
// ============================================================================

/// What the optimizer is asked to improve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
}

/// The project the session works on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_path: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    pub package_manager: Option<String>,
    #[serde(default, rename = "hasCI")]
    pub has_ci: bool,
}

/// Budget for one optimization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerOptions {
    pub max_iterations: u32,
    pub target_score: f64,
    pub timeout_seconds: u64,
}

impl From<&OptimizerSettings> for OptimizerOptions {
    fn from(settings: &OptimizerSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            target_score: settings.target_score,
            timeout_seconds: settings.timeout_seconds,
        }
    }
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self::from(&OptimizerSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    pub task: OptimizationTask,
    pub context: ProjectContext,
    pub options: OptimizerOptions,
}

/// Configuration proposed by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedConfig {
    pub id: String,
    #[serde(default)]
    pub provider: Option<String>,
    /// New content of the provider's instruction file.
    pub instructions_file: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResponse {
    pub iterations: u32,
    pub final_score: f64,
    #[serde(default)]
    pub config: Option<OptimizedConfig>,
    #[serde(default)]
    pub suggestions_applied: u32,
}

/// The external optimizer.
#[async_trait]
pub trait OptimizerClient: Send + Sync {
    /// Run one optimization. Callers bound the call with a timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be reached or fails.
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse>;
}

// ============================================================================
// Optimization records
// ============================================================================

/// Why an optimization was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationTrigger {
    StallDetected,
    ErrorPattern,
    PoorPerformance,
    Manual,
}

impl OptimizationTrigger {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StallDetected => "stall_detected",
            Self::ErrorPattern => "error_pattern",
            Self::PoorPerformance => "poor_performance",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for OptimizationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OptimizationStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One optimization attempt. Terminal once completed or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub id: String,
    pub session_id: String,
    /// Scope that triggered the attempt; `None` for manual triggers.
    pub scope_ref: Option<String>,
    pub trigger: OptimizationTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: OptimizationStatus,
    pub iterations: u32,
    pub initial_score: Option<f64>,
    pub final_score: Option<f64>,
    pub suggestions_applied: u32,
    pub config_applied: bool,
    pub error: Option<String>,
}

impl OptimizationRecord {
    /// New `pending` record.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        scope_ref: Option<String>,
        trigger: OptimizationTrigger,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            scope_ref,
            trigger,
            started_at,
            completed_at: None,
            status: OptimizationStatus::Pending,
            iterations: 0,
            initial_score: None,
            final_score: None,
            suggestions_applied: 0,
            config_applied: false,
            error: None,
        }
    }

    /// Move to `next`, stamping `completed_at` on terminal states.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::InvalidTransition`] when the lifecycle does
    /// not allow it.
    pub fn transition(
        &mut self,
        next: OptimizationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), OverseerError> {
        if !self.status.can_transition_to(next) {
            return Err(OverseerError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    /// Fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::InvalidTransition`] if already terminal.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), OverseerError> {
        self.transition(OptimizationStatus::Failed, at)?;
        self.error = Some(error.into());
        Ok(())
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let score = self
            .final_score
            .map_or_else(|| "-".to_string(), |s| format!("{:.2}", s));
        let mut line = format!(
            "{} {} [{}] session={} iterations={} score={}",
            self.id, self.trigger, self.status, self.session_id, self.iterations, score
        );
        if self.config_applied {
            line.push_str(" applied");
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error={}", error));
        }
        line
    }
}
