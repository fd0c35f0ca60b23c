//! Monitored scopes and their storage.
//!
//! A scope is the monitoring boundary: either every session of a user
//! ([`ScopeKind::Master`]) or the sessions filed under one folder
//! ([`ScopeKind::Folder`]). Each scope carries its own stall threshold and
//! drives its own timer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::OverseerError;
use crate::persist::JsonFile;
use crate::session::SessionInfo;

/// Stall threshold used when a scope does not set one.
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 5 * 60;

/// Floor for the interval between two ticks of a scope.
pub const MIN_TICK_INTERVAL_SECS: u64 = 30;

/// Default filename for persisted scopes.
pub const SCOPES_FILENAME: &str = "scopes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Every session owned by the user.
    Master,
    /// Sessions whose folder matches `scope_ref`.
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeStatus {
    #[default]
    Idle,
    Analyzing,
    Acting,
    Paused,
}

impl ScopeStatus {
    pub const ALL: [ScopeStatus; 4] = [Self::Idle, Self::Analyzing, Self::Acting, Self::Paused];
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Folder => write!(f, "folder"),
        }
    }
}

impl fmt::Display for ScopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Acting => write!(f, "acting"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// A monitoring boundary and its timing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredScope {
    pub id: String,
    pub owner_id: String,
    pub kind: ScopeKind,
    /// Folder id for [`ScopeKind::Folder`] scopes.
    #[serde(default)]
    pub scope_ref: Option<String>,
    #[serde(default)]
    pub stall_threshold_seconds: Option<u64>,
    #[serde(default)]
    pub tick_interval_seconds: Option<u64>,
    #[serde(default)]
    pub status: ScopeStatus,
    pub created_at: DateTime<Utc>,
}

impl MonitoredScope {
    /// Scope over every session of `owner_id`.
    #[must_use]
    pub fn master(owner_id: impl Into<String>) -> Self {
        Self::with_kind(owner_id, ScopeKind::Master, None)
    }

    /// Scope over the sessions of one folder.
    #[must_use]
    pub fn folder(owner_id: impl Into<String>, folder_ref: impl Into<String>) -> Self {
        Self::with_kind(owner_id, ScopeKind::Folder, Some(folder_ref.into()))
    }

    fn with_kind(owner_id: impl Into<String>, kind: ScopeKind, scope_ref: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            kind,
            scope_ref,
            stall_threshold_seconds: None,
            tick_interval_seconds: None,
            status: ScopeStatus::Idle,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_stall_threshold(mut self, seconds: u64) -> Self {
        self.stall_threshold_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, seconds: u64) -> Self {
        self.tick_interval_seconds = Some(seconds);
        self
    }

    /// Threshold after which an inactive session counts as stalled.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(
            self.stall_threshold_seconds
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_STALL_THRESHOLD_SECS),
        )
    }

    /// Interval between two ticks: the configured interval, or half the
    /// stall threshold, never below [`MIN_TICK_INTERVAL_SECS`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        let requested = self
            .tick_interval_seconds
            .unwrap_or(self.stall_threshold().as_secs() / 2);
        Duration::from_secs(requested.max(MIN_TICK_INTERVAL_SECS))
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == ScopeStatus::Paused
    }

    /// Whether `session` falls inside this scope.
    ///
    /// A folder scope without a folder reference observes nothing.
    #[must_use]
    pub fn observes(&self, session: &SessionInfo) -> bool {
        if session.owner_id != self.owner_id {
            return false;
        }
        match self.kind {
            ScopeKind::Master => !session.orchestrator_owned,
            ScopeKind::Folder => match &self.scope_ref {
                Some(folder) => session.folder_ref.as_deref() == Some(folder.as_str()),
                None => false,
            },
        }
    }

    /// Reject definitions that can never observe anything.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::InvalidScope`] for a folder scope without a
    /// folder reference, or a master scope that carries one.
    pub fn validate(&self) -> crate::error::Result<()> {
        match (self.kind, &self.scope_ref) {
            (ScopeKind::Folder, None) => Err(OverseerError::invalid_scope(
                &self.id,
                "folder scope requires a folder reference",
            )),
            (ScopeKind::Folder, Some(folder)) if folder.trim().is_empty() => Err(
                OverseerError::invalid_scope(&self.id, "folder reference is empty"),
            ),
            (ScopeKind::Master, Some(_)) => Err(OverseerError::invalid_scope(
                &self.id,
                "master scope cannot reference a folder",
            )),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        let target = match (&self.kind, &self.scope_ref) {
            (ScopeKind::Master, _) => format!("all sessions of {}", self.owner_id),
            (ScopeKind::Folder, Some(folder)) => format!("folder {}", folder),
            (ScopeKind::Folder, None) => "folder <unset>".to_string(),
        };
        format!(
            "{} [{}] {} (stall after {}s, tick every {}s)",
            self.id,
            self.status,
            target,
            self.stall_threshold().as_secs(),
            self.tick_interval().as_secs()
        )
    }
}

// ============================================================================
// Scope Store
// ============================================================================

/// CRUD access to scope records.
pub trait ScopeStore: Send + Sync {
    /// Scopes, optionally restricted to one owner, in creation order.
    fn list(&self, owner_id: Option<&str>) -> Result<Vec<MonitoredScope>>;

    fn get(&self, scope_id: &str) -> Result<Option<MonitoredScope>>;

    /// Insert or replace a scope.
    fn put(&self, scope: MonitoredScope) -> Result<()>;

    /// Remove a scope. Returns whether it existed.
    fn delete(&self, scope_id: &str) -> Result<bool>;

    /// Set the status only if the scope currently is in one of `from`.
    ///
    /// The check and the write are atomic. Returns the scope as stored
    /// afterwards (unchanged when the status did not match), `None` if
    /// missing.
    fn set_status_if(
        &self,
        scope_id: &str,
        from: &[ScopeStatus],
        status: ScopeStatus,
    ) -> Result<Option<MonitoredScope>>;

    /// Update a scope's status. Returns the updated scope, `None` if missing.
    fn set_status(&self, scope_id: &str, status: ScopeStatus) -> Result<Option<MonitoredScope>> {
        self.set_status_if(scope_id, &ScopeStatus::ALL, status)
    }
}

fn transition(scope: &mut MonitoredScope, from: &[ScopeStatus], status: ScopeStatus) -> MonitoredScope {
    if from.contains(&scope.status) {
        scope.status = status;
    }
    scope.clone()
}

fn sorted(mut scopes: Vec<MonitoredScope>, owner_id: Option<&str>) -> Vec<MonitoredScope> {
    scopes.retain(|s| owner_id.is_none_or(|owner| s.owner_id == owner));
    scopes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    scopes
}

/// Scopes held in memory.
#[derive(Debug, Default)]
pub struct InMemoryScopeStore {
    scopes: RwLock<HashMap<String, MonitoredScope>>,
}

impl InMemoryScopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScopeStore for InMemoryScopeStore {
    fn list(&self, owner_id: Option<&str>) -> Result<Vec<MonitoredScope>> {
        let scopes = self
            .scopes
            .read()
            .map_err(|_| anyhow::anyhow!("scope store lock poisoned"))?;
        Ok(sorted(scopes.values().cloned().collect(), owner_id))
    }

    fn get(&self, scope_id: &str) -> Result<Option<MonitoredScope>> {
        let scopes = self
            .scopes
            .read()
            .map_err(|_| anyhow::anyhow!("scope store lock poisoned"))?;
        Ok(scopes.get(scope_id).cloned())
    }

    fn put(&self, scope: MonitoredScope) -> Result<()> {
        let mut scopes = self
            .scopes
            .write()
            .map_err(|_| anyhow::anyhow!("scope store lock poisoned"))?;
        scopes.insert(scope.id.clone(), scope);
        Ok(())
    }

    fn delete(&self, scope_id: &str) -> Result<bool> {
        let mut scopes = self
            .scopes
            .write()
            .map_err(|_| anyhow::anyhow!("scope store lock poisoned"))?;
        Ok(scopes.remove(scope_id).is_some())
    }

    fn set_status_if(
        &self,
        scope_id: &str,
        from: &[ScopeStatus],
        status: ScopeStatus,
    ) -> Result<Option<MonitoredScope>> {
        let mut scopes = self
            .scopes
            .write()
            .map_err(|_| anyhow::anyhow!("scope store lock poisoned"))?;
        Ok(scopes
            .get_mut(scope_id)
            .map(|scope| transition(scope, from, status)))
    }
}

/// Scopes persisted in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonScopeStore {
    file: JsonFile,
}

impl JsonScopeStore {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    fn read_all(&self) -> Result<Vec<MonitoredScope>> {
        let scopes: Option<Vec<MonitoredScope>> = self
            .file
            .load()
            .with_context(|| format!("Failed to load {}", self.file.path().display()))?;
        Ok(scopes.unwrap_or_default())
    }

    /// Read-modify-write of the whole file under its lock.
    fn update<R>(&self, f: impl FnOnce(&mut Vec<MonitoredScope>) -> R) -> Result<R> {
        self.file
            .update(f)
            .with_context(|| format!("Failed to update {}", self.file.path().display()))
    }
}

impl ScopeStore for JsonScopeStore {
    fn list(&self, owner_id: Option<&str>) -> Result<Vec<MonitoredScope>> {
        Ok(sorted(self.read_all()?, owner_id))
    }

    fn get(&self, scope_id: &str) -> Result<Option<MonitoredScope>> {
        Ok(self.read_all()?.into_iter().find(|s| s.id == scope_id))
    }

    fn put(&self, scope: MonitoredScope) -> Result<()> {
        self.update(|scopes| match scopes.iter_mut().find(|s| s.id == scope.id) {
            Some(existing) => *existing = scope,
            None => scopes.push(scope),
        })
    }

    fn delete(&self, scope_id: &str) -> Result<bool> {
        self.update(|scopes| {
            let before = scopes.len();
            scopes.retain(|s| s.id != scope_id);
            scopes.len() != before
        })
    }

    fn set_status_if(
        &self,
        scope_id: &str,
        from: &[ScopeStatus],
        status: ScopeStatus,
    ) -> Result<Option<MonitoredScope>> {
        self.update(|scopes| {
            scopes
                .iter_mut()
                .find(|s| s.id == scope_id)
                .map(|scope| transition(scope, from, status))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_threshold_and_interval() {
        let scope = MonitoredScope::master("u");
        assert_eq!(scope.stall_threshold(), Duration::from_secs(300));
        assert_eq!(scope.tick_interval(), Duration::from_secs(150));
    }

    #[test]
    fn test_tick_interval_has_floor() {
        let scope = MonitoredScope::master("u").with_stall_threshold(20);
        assert_eq!(scope.tick_interval(), Duration::from_secs(30));

        let scope = MonitoredScope::master("u").with_tick_interval(5);
        assert_eq!(scope.tick_interval(), Duration::from_secs(30));

        let scope = MonitoredScope::master("u").with_stall_threshold(600);
        assert_eq!(scope.tick_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_threshold_uses_default() {
        let scope = MonitoredScope::master("u").with_stall_threshold(0);
        assert_eq!(scope.stall_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn test_master_observes_owner_sessions_except_orchestrated() {
        let scope = MonitoredScope::master("u");
        assert!(scope.observes(&SessionInfo::new("a", "u")));
        assert!(scope.observes(&SessionInfo::new("b", "u").with_folder("f")));
        assert!(!scope.observes(&SessionInfo::new("c", "u").orchestrated()));
        assert!(!scope.observes(&SessionInfo::new("d", "other")));
    }

    #[test]
    fn test_folder_observes_matching_folder_only() {
        let scope = MonitoredScope::folder("u", "f1");
        assert!(scope.observes(&SessionInfo::new("a", "u").with_folder("f1")));
        assert!(!scope.observes(&SessionInfo::new("b", "u").with_folder("f2")));
        assert!(!scope.observes(&SessionInfo::new("c", "u")));
    }

    #[test]
    fn test_folder_without_ref_observes_nothing() {
        let mut scope = MonitoredScope::folder("u", "f1");
        scope.scope_ref = None;
        assert!(!scope.observes(&SessionInfo::new("a", "u").with_folder("f1")));
        assert!(matches!(
            scope.validate(),
            Err(OverseerError::InvalidScope { .. })
        ));
    }

    #[test]
    fn test_validate() {
        assert!(MonitoredScope::master("u").validate().is_ok());
        assert!(MonitoredScope::folder("u", "f").validate().is_ok());
        assert!(MonitoredScope::folder("u", "  ").validate().is_err());

        let mut master = MonitoredScope::master("u");
        master.scope_ref = Some("f".into());
        assert!(master.validate().is_err());
    }

    #[test]
    fn test_in_memory_store_crud() {
        let store = InMemoryScopeStore::new();
        let scope = MonitoredScope::master("u").with_id("s1");
        store.put(scope.clone()).unwrap();
        store
            .put(MonitoredScope::folder("other", "f").with_id("s2"))
            .unwrap();

        assert_eq!(store.get("s1").unwrap(), Some(scope));
        assert_eq!(store.list(None).unwrap().len(), 2);
        assert_eq!(store.list(Some("u")).unwrap().len(), 1);

        let paused = store.set_status("s1", ScopeStatus::Paused).unwrap().unwrap();
        assert!(paused.is_paused());
        assert!(store.get("s1").unwrap().unwrap().is_paused());
        assert!(store.set_status("missing", ScopeStatus::Idle).unwrap().is_none());

        assert!(store.delete("s1").unwrap());
        assert!(!store.delete("s1").unwrap());
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(SCOPES_FILENAME);

        let store = JsonScopeStore::new(&path);
        store
            .put(MonitoredScope::folder("u", "f1").with_id("a").with_stall_threshold(120))
            .unwrap();
        store.put(MonitoredScope::master("u").with_id("b")).unwrap();

        let reopened = JsonScopeStore::new(&path);
        let scope = reopened.get("a").unwrap().unwrap();
        assert_eq!(scope.scope_ref.as_deref(), Some("f1"));
        assert_eq!(scope.stall_threshold_seconds, Some(120));
        assert_eq!(reopened.list(None).unwrap().len(), 2);

        assert!(reopened.delete("a").unwrap());
        assert!(JsonScopeStore::new(&path).get("a").unwrap().is_none());
    }

    #[test]
    fn test_set_status_if_only_moves_from_expected_status() {
        let store = InMemoryScopeStore::new();
        store.put(MonitoredScope::master("u").with_id("s1")).unwrap();
        store.set_status("s1", ScopeStatus::Paused).unwrap();

        let scope = store
            .set_status_if("s1", &[ScopeStatus::Analyzing, ScopeStatus::Acting], ScopeStatus::Idle)
            .unwrap()
            .unwrap();
        assert_eq!(scope.status, ScopeStatus::Paused);

        let scope = store
            .set_status_if("s1", &[ScopeStatus::Paused], ScopeStatus::Idle)
            .unwrap()
            .unwrap();
        assert_eq!(scope.status, ScopeStatus::Idle);
        assert!(store
            .set_status_if("missing", &ScopeStatus::ALL, ScopeStatus::Idle)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_json_store_concurrent_status_updates_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let store = JsonScopeStore::new(temp.path().join(SCOPES_FILENAME));
        store.put(MonitoredScope::master("u").with_id("a")).unwrap();
        store.put(MonitoredScope::folder("u", "f").with_id("b")).unwrap();

        std::thread::scope(|s| {
            let (first, second) = (store.clone(), store.clone());
            s.spawn(move || {
                for _ in 0..200 {
                    first.set_status("a", ScopeStatus::Paused).unwrap();
                }
            });
            s.spawn(move || {
                for _ in 0..200 {
                    second.set_status("b", ScopeStatus::Analyzing).unwrap();
                }
            });
        });

        assert_eq!(store.get("a").unwrap().unwrap().status, ScopeStatus::Paused);
        assert_eq!(store.get("b").unwrap().unwrap().status, ScopeStatus::Analyzing);

        let reopened = JsonScopeStore::new(temp.path().join(SCOPES_FILENAME));
        let guarded = reopened
            .set_status_if("a", &[ScopeStatus::Idle], ScopeStatus::Acting)
            .unwrap()
            .unwrap();
        assert_eq!(guarded.status, ScopeStatus::Paused);
    }

    #[test]
    fn test_summary_mentions_target() {
        let scope = MonitoredScope::folder("u", "backend").with_id("x");
        let summary = scope.summary();
        assert!(summary.contains("folder backend"));
        assert!(summary.contains("[idle]"));
    }
}
