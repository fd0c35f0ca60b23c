//! Session analysis payloads.
//!
//! Analysis is produced elsewhere (knowledge extraction over the session's
//! history) and consumed here as plain data: which files the agent touched,
//! which errors it hit and fixed, which behaviour patterns were detected and
//! what the project looks like. It feeds the error-pattern trigger and the
//! optimizer request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::persist::file_stem;
use crate::session::SessionInfo;

/// Unfixed errors required before the error-pattern trigger fires.
pub const ERROR_PATTERN_THRESHOLD: usize = 3;

/// What is known about a session's recent work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalysis {
    #[serde(default)]
    pub files_touched: Vec<String>,

    #[serde(default)]
    pub errors_encountered: Vec<String>,

    #[serde(default)]
    pub errors_fixed: Vec<String>,

    /// Behaviour patterns, e.g. "reruns the same failing test".
    #[serde(default)]
    pub detected_patterns: Vec<String>,

    #[serde(default)]
    pub project_path: Option<String>,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub frameworks: Vec<String>,

    #[serde(default)]
    pub package_manager: Option<String>,

    #[serde(default, rename = "hasCI")]
    pub has_ci: bool,
}

impl SessionAnalysis {
    /// Errors encountered minus errors fixed, never negative.
    #[must_use]
    pub fn unfixed_errors(&self) -> usize {
        self.errors_encountered
            .len()
            .saturating_sub(self.errors_fixed.len())
    }

    /// Whether enough errors remain unfixed to warrant optimization.
    #[must_use]
    pub fn has_error_pattern(&self) -> bool {
        self.unfixed_errors() >= ERROR_PATTERN_THRESHOLD
    }

    /// The `limit` most recent errors, oldest first.
    #[must_use]
    pub fn recent_errors(&self, limit: usize) -> &[String] {
        let start = self.errors_encountered.len().saturating_sub(limit);
        &self.errors_encountered[start..]
    }
}

/// Provider of analysis payloads.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    /// Latest analysis for the session, `None` if none was produced.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing payload cannot be read.
    async fn analyze(&self, session: &SessionInfo) -> Result<Option<SessionAnalysis>>;
}

/// Reads `<dir>/<session id>.json`.
#[derive(Debug, Clone)]
pub struct FileAnalysisSource {
    dir: PathBuf,
}

impl FileAnalysisSource {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }
}

#[async_trait]
impl AnalysisSource for FileAnalysisSource {
    async fn analyze(&self, session: &SessionInfo) -> Result<Option<SessionAnalysis>> {
        let path = self.path_for(&session.id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let analysis = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn analysis(encountered: usize, fixed: usize) -> SessionAnalysis {
        SessionAnalysis {
            errors_encountered: (0..encountered).map(|i| format!("E{i}")).collect(),
            errors_fixed: (0..fixed).map(|i| format!("E{i}")).collect(),
            ..SessionAnalysis::default()
        }
    }

    #[test]
    fn test_unfixed_errors() {
        assert_eq!(analysis(5, 2).unfixed_errors(), 3);
        assert_eq!(analysis(1, 4).unfixed_errors(), 0);
        assert!(analysis(5, 2).has_error_pattern());
        assert!(!analysis(4, 2).has_error_pattern());
    }

    #[test]
    fn test_recent_errors() {
        let a = analysis(5, 0);
        assert_eq!(a.recent_errors(2), &["E3".to_string(), "E4".to_string()]);
        assert_eq!(a.recent_errors(10).len(), 5);
    }

    #[tokio::test]
    async fn test_file_source() {
        let temp = TempDir::new().unwrap();
        let source = FileAnalysisSource::new(temp.path());
        let session = SessionInfo::new("s-1", "u");

        assert!(source.analyze(&session).await.unwrap().is_none());

        std::fs::write(
            source.path_for("s-1"),
            r#"{"filesTouched": ["src/main.rs"], "errorsEncountered": ["E1"], "language": "rust", "hasCI": true}"#,
        )
        .unwrap();
        let loaded = source.analyze(&session).await.unwrap().unwrap();
        assert_eq!(loaded.files_touched, vec!["src/main.rs".to_string()]);
        assert_eq!(loaded.language.as_deref(), Some("rust"));
        assert!(loaded.has_ci);
        assert_eq!(loaded.unfixed_errors(), 1);
    }

    #[tokio::test]
    async fn test_file_source_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let source = FileAnalysisSource::new(temp.path());
        std::fs::write(source.path_for("s"), "garbage").unwrap();
        assert!(source.analyze(&SessionInfo::new("s", "u")).await.is_err());
    }
}
