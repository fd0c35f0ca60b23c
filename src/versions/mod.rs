//! Versioned agent configuration with rollback.
//!
//! Every time a configuration is about to be replaced, the content currently
//! on disk is captured as an immutable [`ConfigVersionSnapshot`] and pushed on
//! the session's version stack. The top of the stack is the active version;
//! rolling back pops it (marking it rolled back) and restores the content of
//! the new top.
//!
//! # Components
//!
//! - [`ConfigVersionStore`] - snapshot, history and rollback per session
//! - [`RollbackController`] - automatic rollback of degraded versions
//! - [`VersionPersistence`] - optional on-disk history per session

pub mod persistence;
pub mod rollback;
pub mod store;

pub use persistence::{VersionPersistence, VERSIONS_SCHEMA};
pub use rollback::{RollbackController, AUTO_ROLLBACK_REASON};
pub use store::ConfigVersionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::provider::AgentProvider;

// ============================================================================
// Snapshot
// ============================================================================

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Captured configuration content of one version.
///
/// Only `rolled_back` and `rollback_reason` ever change, and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersionSnapshot {
    pub id: SnapshotId,
    pub session_id: String,
    /// Configuration id reported by whoever produced this version.
    pub config_id: String,
    /// 1-based position on the stack at creation time.
    pub version: u32,
    pub content: String,
    pub provider: AgentProvider,
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub rollback_reason: Option<String>,
}

impl ConfigVersionSnapshot {
    /// Mark as rolled back. Returns false if it already was.
    pub fn mark_rolled_back(&mut self, reason: impl Into<String>) -> bool {
        if self.rolled_back {
            return false;
        }
        self.rolled_back = true;
        self.rollback_reason = Some(reason.into());
        true
    }

    /// Short content fingerprint for display.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.content.as_bytes());
        hex::encode(&digest[..6])
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let score = self
            .score
            .map_or_else(|| "-".to_string(), |s| format!("{:.2}", s));
        let state = if self.rolled_back { " (rolled back)" } else { "" };
        format!(
            "v{} {} [{}] score={} {}b {}{}",
            self.version,
            self.config_id,
            self.provider,
            score,
            self.content.len(),
            self.content_hash(),
            state
        )
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Version history of one session plus its active stack.
///
/// `stack` holds the ids of every snapshot that is not rolled back, oldest
/// first; `history` keeps all snapshots in creation order.
#[derive(Debug, Default)]
pub struct SessionVersions {
    loaded: bool,
    history: Vec<ConfigVersionSnapshot>,
    stack: Vec<SnapshotId>,
}

impl SessionVersions {
    /// Placeholder until the history has been read from persistence.
    pub(crate) fn unloaded() -> Self {
        Self::default()
    }

    /// Rebuild state from a persisted history.
    pub(crate) fn from_history(history: Vec<ConfigVersionSnapshot>) -> Self {
        let stack = history
            .iter()
            .filter(|s| !s.rolled_back)
            .map(|s| s.id.clone())
            .collect();
        Self {
            loaded: true,
            history,
            stack,
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn find(&self, id: &SnapshotId) -> Option<&ConfigVersionSnapshot> {
        self.history.iter().find(|s| &s.id == id)
    }

    /// Active version.
    #[must_use]
    pub fn top(&self) -> Option<&ConfigVersionSnapshot> {
        self.stack.last().and_then(|id| self.find(id))
    }

    /// Version that becomes active after one rollback.
    #[must_use]
    pub fn previous(&self) -> Option<&ConfigVersionSnapshot> {
        self.stack
            .len()
            .checked_sub(2)
            .and_then(|i| self.stack.get(i))
            .and_then(|id| self.find(id))
    }

    pub(crate) fn push(&mut self, snapshot: ConfigVersionSnapshot) {
        self.stack.push(snapshot.id.clone());
        self.history.push(snapshot);
    }

    /// Pop the active version and mark it rolled back.
    pub(crate) fn pop_rolled_back(&mut self, reason: &str) -> Option<ConfigVersionSnapshot> {
        let id = self.stack.pop()?;
        let snapshot = self.history.iter_mut().find(|s| s.id == id)?;
        snapshot.mark_rolled_back(reason);
        Some(snapshot.clone())
    }

    /// All snapshots ordered by version, ties by creation time.
    #[must_use]
    pub fn sorted_history(&self) -> Vec<ConfigVersionSnapshot> {
        let mut history = self.history.clone();
        history.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        history
    }

    pub(crate) fn history(&self) -> &[ConfigVersionSnapshot] {
        &self.history
    }
}

// ============================================================================
// Rollback outcome
// ============================================================================

/// Result of a rollback request. Failures leave all state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    /// Version that is active after the rollback.
    pub rolled_back_to: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RollbackOutcome {
    #[must_use]
    pub fn succeeded(version: u32) -> Self {
        Self {
            success: true,
            rolled_back_to: Some(version),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            rolled_back_to: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn snapshot(version: u32, content: &str) -> ConfigVersionSnapshot {
        ConfigVersionSnapshot {
            id: SnapshotId::new(),
            session_id: "s".into(),
            config_id: format!("cfg-{version}"),
            version,
            content: content.into(),
            provider: AgentProvider::Claude,
            score: None,
            created_at: Utc::now(),
            rolled_back: false,
            rollback_reason: None,
        }
    }

    #[test]
    fn test_mark_rolled_back_only_once() {
        let mut snap = snapshot(1, "a");
        assert!(snap.mark_rolled_back("first"));
        assert!(!snap.mark_rolled_back("second"));
        assert_eq!(snap.rollback_reason.as_deref(), Some("first"));
    }

    #[test]
    fn test_top_previous_and_pop() {
        let mut versions = SessionVersions::unloaded();
        assert!(versions.top().is_none());
        assert!(versions.previous().is_none());

        versions.push(snapshot(1, "a"));
        assert!(versions.previous().is_none());
        versions.push(snapshot(2, "b"));
        assert_eq!(versions.top().unwrap().version, 2);
        assert_eq!(versions.previous().unwrap().version, 1);

        let popped = versions.pop_rolled_back("bad").unwrap();
        assert_eq!(popped.version, 2);
        assert!(popped.rolled_back);
        assert_eq!(versions.stack_len(), 1);
        assert_eq!(versions.history().len(), 2);
        assert_eq!(versions.top().unwrap().version, 1);
    }

    #[test]
    fn test_from_history_excludes_rolled_back() {
        let mut rolled = snapshot(2, "b");
        rolled.mark_rolled_back("x");
        let versions = SessionVersions::from_history(vec![snapshot(1, "a"), rolled]);
        assert!(versions.is_loaded());
        assert_eq!(versions.stack_len(), 1);
        assert_eq!(versions.top().unwrap().content, "a");
    }

    #[test]
    fn test_sorted_history_orders_by_version() {
        let mut versions = SessionVersions::unloaded();
        versions.push(snapshot(2, "b"));
        versions.push(snapshot(1, "a"));
        let order: Vec<u32> = versions.sorted_history().iter().map(|s| s.version).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = RollbackOutcome::succeeded(3);
        assert!(ok.success);
        assert_eq!(ok.rolled_back_to, Some(3));

        let failed = RollbackOutcome::failed("nope");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("nope"));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_summary_and_hash() {
        let snap = snapshot(1, "content");
        assert_eq!(snap.content_hash().len(), 12);
        assert!(snap.summary().starts_with("v1 cfg-1 [claude]"));
    }
}
