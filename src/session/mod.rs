//! Read-only view of the agent sessions being monitored.
//!
//! Sessions live in the terminal backend. The monitor only reads them through
//! [`SessionRegistry`] (cheap timestamp and listing queries) and, on demand,
//! through [`DiagnosticCapture`] (expensive full-text capture).
//!
//! Concrete collaborators:
//!
//! - [`FileSessionRegistry`] - sessions published as JSON by the backend
//! - [`TmuxCapture`] - scrollback capture through `tmux capture-pane`

pub mod capture;
pub mod file_registry;

pub use capture::TmuxCapture;
pub use file_registry::{FileSessionRegistry, SESSIONS_FILENAME};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

use crate::provider::AgentProvider;

/// One agent-driven terminal session as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// User that owns the session.
    pub owner_id: String,

    /// Folder the session is filed under, if any.
    #[serde(default)]
    pub folder_ref: Option<String>,

    /// `None` when the session runs no agent.
    #[serde(default, deserialize_with = "deserialize_provider")]
    pub agent_provider: Option<AgentProvider>,

    /// Sessions spawned by an orchestrator are excluded from master scopes.
    #[serde(default)]
    pub orchestrator_owned: bool,

    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,

    /// Project directory holding the agent's instruction file.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Terminal handle used for diagnostic capture (tmux target).
    #[serde(default)]
    pub terminal_ref: Option<String>,
}

impl SessionInfo {
    /// Minimal session owned by `owner_id`.
    #[must_use]
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            owner_id: owner_id.into(),
            folder_ref: None,
            agent_provider: None,
            orchestrator_owned: false,
            last_activity_at: None,
            working_dir: None,
            terminal_ref: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_folder(mut self, folder_ref: impl Into<String>) -> Self {
        self.folder_ref = Some(folder_ref.into());
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: AgentProvider) -> Self {
        self.agent_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_terminal_ref(mut self, terminal_ref: impl Into<String>) -> Self {
        self.terminal_ref = Some(terminal_ref.into());
        self
    }

    #[must_use]
    pub fn orchestrated(mut self) -> Self {
        self.orchestrator_owned = true;
        self
    }

    /// Label for log lines: name when set, id otherwise.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Accepts any provider string; "none" and empty strings map to `None`.
fn deserialize_provider<'de, D>(deserializer: D) -> std::result::Result<Option<AgentProvider>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(AgentProvider::parse))
}

/// Activity registry of the terminal backend.
///
/// Queries must be cheap; they run on every tick of every scope.
pub trait SessionRegistry: Send + Sync {
    /// Last recorded activity, `None` if the session never produced any.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or the backend is down.
    fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Active sessions belonging to `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn list_active_sessions(&self, owner_id: &str) -> Result<Vec<SessionInfo>>;

    /// Look up a single session by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>>;

    /// Directory holding the session's instruction file, if known.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn session_dir(&self, session_id: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .get_session(session_id)?
            .and_then(|session| session.working_dir))
    }
}

/// On-demand capture of a session's full terminal text.
#[async_trait]
pub trait DiagnosticCapture: Send + Sync {
    /// Capture the text currently visible in (and scrolled out of) the
    /// terminal. `None` when the terminal no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture tool fails to run.
    async fn capture_text(&self, terminal_ref: &str) -> Result<Option<String>>;
}
