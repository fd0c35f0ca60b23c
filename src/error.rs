//! Custom error types for Overseer.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the monitor.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Overseer operations
#[derive(Error, Debug)]
pub enum OverseerError {
    // =========================================================================
    // Scope Errors
    // =========================================================================
    /// No monitored scope with this id
    #[error("Scope not found: {scope_id}")]
    ScopeNotFound { scope_id: String },

    /// Scope definition is unusable (e.g. folder scope without folder reference)
    #[error("Invalid scope {scope_id}: {reason}")]
    InvalidScope { scope_id: String, reason: String },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session is unknown to the session registry
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Session registry could not be queried
    #[error("Session registry error: {message}")]
    Registry { message: String },

    // =========================================================================
    // Optimizer Errors
    // =========================================================================
    /// External optimizer call failed or timed out
    #[error("Optimizer call failed: {message}")]
    OptimizerCallFailed { message: String },

    /// Optimization record does not exist
    #[error("Optimization not found: {id}")]
    OptimizationNotFound { id: String },

    /// Requested transition is not allowed from the current status
    #[error("Invalid optimization transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Attempt is past its last cancellation point and writing its config
    #[error("Optimization {id} is applying its configuration and can no longer be cancelled")]
    OptimizationApplying { id: String },

    // =========================================================================
    // Configuration Storage Errors
    // =========================================================================
    /// Persisted agent configuration could not be read
    #[error("Failed to read agent configuration for session {session_id}: {message}")]
    ConfigReadFailed { session_id: String, message: String },

    /// Persisted agent configuration could not be written
    #[error("Failed to write agent configuration for session {session_id}: {message}")]
    ConfigWriteFailed { session_id: String, message: String },

    // =========================================================================
    // Versioning Errors
    // =========================================================================
    /// Not enough versions on the stack to roll back
    #[error("Rollback unavailable for session {session_id}: {versions} version(s) on stack, need at least 2")]
    RollbackUnavailable { session_id: String, versions: usize },

    /// Version history could not be persisted or loaded
    #[error("Version history error: {message}")]
    Persistence { message: String },

    // =========================================================================
    // Settings Errors
    // =========================================================================
    /// Failed to load settings
    #[error("Settings error: {message}")]
    Settings {
        message: String,
        path: Option<PathBuf>,
    },

    /// Settings loaded but failed validation
    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OverseerError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a scope-not-found error
    pub fn scope_not_found(scope_id: impl Into<String>) -> Self {
        Self::ScopeNotFound {
            scope_id: scope_id.into(),
        }
    }

    /// Create an invalid-scope error
    pub fn invalid_scope(scope_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidScope {
            scope_id: scope_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a session-not-found error
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create an optimizer failure
    pub fn optimizer(message: impl Into<String>) -> Self {
        Self::OptimizerCallFailed {
            message: message.into(),
        }
    }

    /// Create a configuration read failure
    pub fn config_read(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigReadFailed {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Create a configuration write failure
    pub fn config_write(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigWriteFailed {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a settings error
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
            path: None,
        }
    }

    /// Create a settings error with path
    pub fn settings_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Settings {
            message: message.into(),
            path: Some(path),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Lookup failures that skip one scope cycle without stopping its timer
    pub fn skips_cycle(&self) -> bool {
        matches!(
            self,
            Self::ScopeNotFound { .. }
                | Self::InvalidScope { .. }
                | Self::SessionNotFound { .. }
                | Self::Registry { .. }
        )
    }

    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Registry { .. }
                | Self::OptimizerCallFailed { .. }
                | Self::ConfigReadFailed { .. }
                | Self::ConfigWriteFailed { .. }
                | Self::Persistence { .. }
                | Self::Io(_)
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ScopeNotFound { .. } | Self::SessionNotFound { .. } => 2,
            Self::InvalidScope { .. } => 3,
            Self::RollbackUnavailable { .. } => 4,
            Self::OptimizerCallFailed { .. } => 5,
            Self::ConfigReadFailed { .. } | Self::ConfigWriteFailed { .. } => 6,
            Self::Settings { .. } | Self::InvalidSettings { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Overseer results
pub type Result<T> = std::result::Result<T, OverseerError>;

/// Extension trait for converting collaborator errors to OverseerError
pub trait IntoOverseerError<T> {
    fn into_registry_error(self) -> Result<T>;
    fn into_config_read(self, session_id: &str) -> Result<T>;
    fn into_config_write(self, session_id: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoOverseerError<T> for std::result::Result<T, E> {
    fn into_registry_error(self) -> Result<T> {
        self.map_err(|e| OverseerError::registry(format!("{:#}", e.into())))
    }

    fn into_config_read(self, session_id: &str) -> Result<T> {
        self.map_err(|e| OverseerError::config_read(session_id, format!("{:#}", e.into())))
    }

    fn into_config_write(self, session_id: &str) -> Result<T> {
        self.map_err(|e| OverseerError::config_write(session_id, format!("{:#}", e.into())))
    }
}
