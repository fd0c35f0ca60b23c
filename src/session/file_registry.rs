//! Session registry backed by a JSON file published by the terminal backend.
//!
//! The backend rewrites `sessions.json` whenever sessions start, stop or
//! produce output. The file is re-read on every query, so the monitor always
//! sees the backend's latest view without holding any state of its own.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{SessionInfo, SessionRegistry};

/// Default filename inside the data directory.
pub const SESSIONS_FILENAME: &str = "sessions.json";

fn default_true() -> bool {
    true
}

/// One line of the backend's session table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(flatten)]
    pub session: SessionInfo,

    /// Closed sessions stay listed until the backend prunes them.
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    #[serde(default)]
    sessions: Vec<SessionEntry>,
}

/// Reads sessions from `<data_dir>/sessions.json`.
#[derive(Debug, Clone)]
pub struct FileSessionRegistry {
    path: PathBuf,
}

impl FileSessionRegistry {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Vec<SessionEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let file: SessionsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(file.sessions)
    }

    /// Replace the session table (used by the backend and by tests).
    pub fn write_sessions(&self, entries: &[SessionEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = SessionsFile {
            sessions: entries.to_vec(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

impl SessionRegistry for FileSessionRegistry {
    fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        let entry = self
            .read_entries()?
            .into_iter()
            .find(|e| e.session.id == session_id)
            .with_context(|| format!("Unknown session: {}", session_id))?;
        Ok(entry.session.last_activity_at)
    }

    fn list_active_sessions(&self, owner_id: &str) -> Result<Vec<SessionInfo>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|e| e.active && e.session.owner_id == owner_id)
            .map(|e| e.session)
            .collect())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .find(|e| e.session.id == session_id)
            .map(|e| e.session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(session: SessionInfo, active: bool) -> SessionEntry {
        SessionEntry { session, active }
    }

    #[test]
    fn test_missing_file_lists_nothing() {
        let temp = TempDir::new().unwrap();
        let registry = FileSessionRegistry::new(temp.path().join(SESSIONS_FILENAME));
        assert!(registry.list_active_sessions("u").unwrap().is_empty());
        assert!(registry.get_session("s").unwrap().is_none());
    }

    #[test]
    fn test_lists_only_active_sessions_of_owner() {
        let temp = TempDir::new().unwrap();
        let registry = FileSessionRegistry::new(temp.path().join(SESSIONS_FILENAME));
        registry
            .write_sessions(&[
                entry(SessionInfo::new("a", "u1"), true),
                entry(SessionInfo::new("b", "u1"), false),
                entry(SessionInfo::new("c", "u2"), true),
            ])
            .unwrap();

        let ids: Vec<String> = registry
            .list_active_sessions("u1")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[test]
    fn test_last_activity() {
        let temp = TempDir::new().unwrap();
        let registry = FileSessionRegistry::new(temp.path().join(SESSIONS_FILENAME));
        let at = Utc::now();
        registry
            .write_sessions(&[
                entry(SessionInfo::new("a", "u").with_last_activity(at), true),
                entry(SessionInfo::new("b", "u"), true),
            ])
            .unwrap();

        assert_eq!(registry.last_activity("a").unwrap(), Some(at));
        assert_eq!(registry.last_activity("b").unwrap(), None);
        assert!(registry.last_activity("zzz").is_err());
    }

    #[test]
    fn test_active_defaults_to_true() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(SESSIONS_FILENAME);
        std::fs::write(
            &path,
            r#"{"sessions": [{"id": "a", "owner_id": "u", "agent_provider": "claude"}]}"#,
        )
        .unwrap();

        let registry = FileSessionRegistry::new(&path);
        let sessions = registry.list_active_sessions("u").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions[0].agent_provider,
            Some(crate::provider::AgentProvider::Claude)
        );
    }
}
