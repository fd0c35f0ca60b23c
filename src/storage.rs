//! Access to the agent instruction file of a session.
//!
//! The instruction file is the "configuration" that optimization rewrites and
//! rollback restores. Its name depends on the agent provider (see
//! [`crate::provider`]) and it lives in the session's working directory.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::provider::AgentProvider;
use crate::session::SessionRegistry;

/// Read/write access to persisted agent configuration.
pub trait ConfigStorage: Send + Sync {
    /// Current configuration content.
    ///
    /// `Ok(None)` when the session has no known storage location;
    /// `Ok(Some(String::new()))` when the location is known but no file
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the location is known but cannot be read.
    fn read_config(&self, session_id: &str, provider: AgentProvider) -> Result<Option<String>>;

    /// Replace the configuration content.
    ///
    /// # Errors
    ///
    /// Returns an error if the location is unknown or the write fails.
    fn write_config(&self, session_id: &str, provider: AgentProvider, content: &str)
        -> Result<()>;
}

/// Instruction files in each session's working directory.
pub struct FsConfigStorage {
    sessions: Arc<dyn SessionRegistry>,
}

impl FsConfigStorage {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { sessions }
    }

    /// Path of the provider's instruction file, `None` if the session has no
    /// working directory.
    pub fn config_path(
        &self,
        session_id: &str,
        provider: AgentProvider,
    ) -> Result<Option<PathBuf>> {
        Ok(self
            .sessions
            .session_dir(session_id)?
            .map(|dir| dir.join(provider.config_filename())))
    }
}

impl ConfigStorage for FsConfigStorage {
    fn read_config(&self, session_id: &str, provider: AgentProvider) -> Result<Option<String>> {
        let Some(path) = self.config_path(session_id, provider)? else {
            return Ok(None);
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Some(String::new())),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write_config(
        &self,
        session_id: &str,
        provider: AgentProvider,
        content: &str,
    ) -> Result<()> {
        let path = self
            .config_path(session_id, provider)?
            .with_context(|| format!("Session {} has no working directory", session_id))?;

        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
