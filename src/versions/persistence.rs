//! Version history persistence layer.
//!
//! One JSON document per session under the versions directory. The active
//! stack is not stored; it is rebuilt from the `rolled_back` flags on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::ConfigVersionSnapshot;
use crate::error::Result;
use crate::persist::{file_stem, JsonFile};

/// Current schema version for version history files.
pub const VERSIONS_SCHEMA: u32 = 1;

/// Minimum supported schema version.
pub const MIN_VERSIONS_SCHEMA: u32 = 1;

/// On-disk shape of one session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionFile {
    schema: u32,
    session_id: String,
    snapshots: Vec<ConfigVersionSnapshot>,
    updated_at: DateTime<Utc>,
}

/// Stores version histories as `<dir>/<session>.json`.
#[derive(Debug, Clone)]
pub struct VersionPersistence {
    dir: PathBuf,
}

impl VersionPersistence {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `session_id`'s history.
    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }

    /// Load a session's history, empty when absent or unreadable.
    pub fn load(&self, session_id: &str) -> Result<Vec<ConfigVersionSnapshot>> {
        let file: Option<VersionFile> = JsonFile::new(self.path_for(session_id)).load()?;
        let Some(file) = file else {
            return Ok(Vec::new());
        };

        if file.schema < MIN_VERSIONS_SCHEMA || file.schema > VERSIONS_SCHEMA {
            warn!(
                "Incompatible version history schema {} for session {} (expected {}-{}), ignoring",
                file.schema, session_id, MIN_VERSIONS_SCHEMA, VERSIONS_SCHEMA
            );
            return Ok(Vec::new());
        }
        if file.session_id != session_id {
            warn!(
                "Version history at {} belongs to session {}, ignoring",
                self.path_for(session_id).display(),
                file.session_id
            );
            return Ok(Vec::new());
        }
        Ok(file.snapshots)
    }

    /// Replace a session's stored history.
    pub fn save(&self, session_id: &str, snapshots: &[ConfigVersionSnapshot]) -> Result<()> {
        let file = VersionFile {
            schema: VERSIONS_SCHEMA,
            session_id: session_id.to_string(),
            snapshots: snapshots.to_vec(),
            updated_at: Utc::now(),
        };
        JsonFile::new(self.path_for(session_id)).save(&file)
    }
}
