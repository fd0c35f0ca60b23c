//! Per-session version stacks.

use std::sync::{Arc, MutexGuard};
use tracing::{debug, info, warn};

use super::{
    ConfigVersionSnapshot, RollbackOutcome, SessionVersions, SnapshotId, VersionPersistence,
};
use crate::error::{IntoOverseerError, OverseerError, Result};
use crate::performance::PerformanceTracker;
use crate::provider::AgentProvider;
use crate::registry::{lock, MonitoringRegistry};
use crate::storage::ConfigStorage;

/// Snapshot, history and rollback of agent configuration per session.
///
/// All operations on one session serialise on that session's lock; the
/// configuration read (snapshot) and write (rollback) happen while it is held
/// so the stack always matches what is on disk.
pub struct ConfigVersionStore {
    registry: Arc<MonitoringRegistry>,
    storage: Arc<dyn ConfigStorage>,
    tracker: PerformanceTracker,
    persistence: Option<VersionPersistence>,
}

impl ConfigVersionStore {
    #[must_use]
    pub fn new(registry: Arc<MonitoringRegistry>, storage: Arc<dyn ConfigStorage>) -> Self {
        let tracker = PerformanceTracker::new(Arc::clone(&registry));
        Self {
            registry,
            storage,
            tracker,
            persistence: None,
        }
    }

    /// Keep histories on disk across restarts.
    #[must_use]
    pub fn with_persistence(mut self, persistence: VersionPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Tracker whose records this store resets.
    #[must_use]
    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// Run `f` with the session's versions locked and loaded.
    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionVersions) -> T) -> T {
        let handle = self.registry.session_versions(session_id);
        let mut versions = lock(&handle);
        self.ensure_loaded(session_id, &mut versions);
        f(&mut versions)
    }

    fn ensure_loaded(&self, session_id: &str, versions: &mut MutexGuard<'_, SessionVersions>) {
        if versions.is_loaded() {
            return;
        }

        let history = match &self.persistence {
            Some(persistence) => persistence.load(session_id).unwrap_or_else(|e| {
                warn!("Failed to load version history for {}: {}", session_id, e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        if history.is_empty() {
            versions.mark_loaded();
            return;
        }

        **versions = SessionVersions::from_history(history);
        if let Some(top) = versions.top() {
            debug!(
                "Loaded {} version(s) for session {}, active v{}",
                versions.history().len(),
                session_id,
                top.version
            );
            if self.tracker.current(session_id).is_none() {
                self.tracker.reset(session_id, top.id.as_str());
            }
        }
    }

    fn persist(&self, session_id: &str, versions: &SessionVersions) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(session_id, versions.history()) {
                warn!("Failed to persist version history for {}: {}", session_id, e);
            }
        }
    }

    /// Capture the currently persisted configuration as the next version.
    ///
    /// The new snapshot becomes active and its performance counters start at
    /// zero. Returns `Ok(None)` when the session has no known configuration
    /// location.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ConfigReadFailed`] if the configuration
    /// exists but cannot be read; nothing is pushed in that case.
    pub fn snapshot(
        &self,
        session_id: &str,
        config_id: &str,
        provider: AgentProvider,
        score: Option<f64>,
    ) -> Result<Option<ConfigVersionSnapshot>> {
        self.with_session(session_id, |versions| {
            let Some(content) = self
                .storage
                .read_config(session_id, provider)
                .into_config_read(session_id)?
            else {
                debug!("No configuration location for session {}", session_id);
                return Ok(None);
            };

            let snapshot = ConfigVersionSnapshot {
                id: SnapshotId::new(),
                session_id: session_id.to_string(),
                config_id: config_id.to_string(),
                version: versions.stack_len() as u32 + 1,
                content,
                provider,
                score,
                created_at: self.registry.now(),
                rolled_back: false,
                rollback_reason: None,
            };

            info!(
                "Snapshot v{} for session {} ({} bytes, config {})",
                snapshot.version,
                session_id,
                snapshot.content.len(),
                config_id
            );

            versions.push(snapshot.clone());
            self.persist(session_id, versions);
            self.tracker.reset(session_id, snapshot.id.as_str());
            Ok(Some(snapshot))
        })
    }

    /// Write new configuration content for the session.
    ///
    /// Callers applying a new configuration call [`Self::snapshot`] first.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ConfigWriteFailed`] if the write fails.
    pub fn write(&self, session_id: &str, provider: AgentProvider, content: &str) -> Result<()> {
        self.storage
            .write_config(session_id, provider, content)
            .into_config_write(session_id)
    }

    /// Every snapshot of the session, ascending by version, rolled-back
    /// entries included.
    #[must_use]
    pub fn history(&self, session_id: &str) -> Vec<ConfigVersionSnapshot> {
        self.with_session(session_id, |versions| versions.sorted_history())
    }

    /// Active version.
    #[must_use]
    pub fn active(&self, session_id: &str) -> Option<ConfigVersionSnapshot> {
        self.with_session(session_id, |versions| versions.top().cloned())
    }

    /// Number of versions on the active stack.
    #[must_use]
    pub fn stack_len(&self, session_id: &str) -> usize {
        self.with_session(session_id, |versions| versions.stack_len())
    }

    /// Revert to the previous version.
    ///
    /// Restores the previous snapshot's content, marks the active snapshot
    /// rolled back with `reason` and resets performance tracking. Any failure
    /// is reported in the outcome and leaves every piece of state untouched.
    pub fn rollback(&self, session_id: &str, reason: &str) -> RollbackOutcome {
        match self.rollback_if(session_id, reason, |_| true) {
            Ok(Some(version)) => RollbackOutcome::succeeded(version),
            Ok(None) => RollbackOutcome::failed("rollback declined"),
            Err(e) => {
                warn!("Rollback failed for session {}: {}", session_id, e);
                RollbackOutcome::failed(e)
            }
        }
    }

    /// Roll back when `guard` accepts the current stack length.
    ///
    /// The guard runs under the session lock, so concurrent callers cannot
    /// both pass it. Returns the restored version, `None` when the guard
    /// declined.
    pub(crate) fn rollback_if(
        &self,
        session_id: &str,
        reason: &str,
        guard: impl FnOnce(usize) -> bool,
    ) -> Result<Option<u32>> {
        self.with_session(session_id, |versions| {
            if !guard(versions.stack_len()) {
                return Ok(None);
            }
            if versions.stack_len() < 2 {
                return Err(OverseerError::RollbackUnavailable {
                    session_id: session_id.to_string(),
                    versions: versions.stack_len(),
                });
            }

            let (target_id, target_version, provider, content) = match versions.previous() {
                Some(target) => (
                    target.id.clone(),
                    target.version,
                    target.provider,
                    target.content.clone(),
                ),
                None => {
                    return Err(OverseerError::RollbackUnavailable {
                        session_id: session_id.to_string(),
                        versions: versions.stack_len(),
                    })
                }
            };

            self.write(session_id, provider, &content)?;

            let popped = versions.pop_rolled_back(reason);
            self.persist(session_id, versions);
            self.tracker.reset(session_id, target_id.as_str());

            info!(
                "Rolled back session {} from v{} to v{}: {}",
                session_id,
                popped.map_or(0, |p| p.version),
                target_version,
                reason
            );
            Ok(Some(target_version))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::PerformanceEvent;
    use crate::testing::MockConfigStorage;
    use tempfile::TempDir;

    fn store_with(storage: MockConfigStorage) -> (ConfigVersionStore, Arc<MockConfigStorage>) {
        let storage = Arc::new(storage);
        let store = ConfigVersionStore::new(
            Arc::new(MonitoringRegistry::new()),
            Arc::clone(&storage) as Arc<dyn ConfigStorage>,
        );
        (store, storage)
    }

    #[test]
    fn test_first_snapshot_is_version_one_with_zeroed_tracker() {
        let (store, _) = store_with(MockConfigStorage::new().with_config("s", "original"));
        let snap = store
            .snapshot("s", "cfg-1", AgentProvider::Claude, Some(0.85))
            .unwrap()
            .unwrap();

        assert_eq!(snap.version, 1);
        assert_eq!(snap.content, "original");
        assert_eq!(snap.score, Some(0.85));
        let record = store.tracker().current("s").unwrap();
        assert_eq!(record.config_version_id, snap.id.as_str());
        assert_eq!(record.total_events(), 0);
    }

    #[test]
    fn test_snapshot_of_missing_file_is_empty_content() {
        let (store, _) = store_with(MockConfigStorage::new().with_location("s"));
        let snap = store
            .snapshot("s", "cfg", AgentProvider::Codex, None)
            .unwrap()
            .unwrap();
        assert_eq!(snap.content, "");
    }

    #[test]
    fn test_snapshot_unresolvable_session_is_none() {
        let (store, _) = store_with(MockConfigStorage::new());
        assert!(store
            .snapshot("ghost", "cfg", AgentProvider::Claude, None)
            .unwrap()
            .is_none());
        assert_eq!(store.stack_len("ghost"), 0);
    }

    #[test]
    fn test_snapshot_read_failure_pushes_nothing() {
        let (store, _) = store_with(MockConfigStorage::new().with_location("s").failing_reads());
        let err = store
            .snapshot("s", "cfg", AgentProvider::Claude, None)
            .unwrap_err();
        assert!(matches!(err, OverseerError::ConfigReadFailed { .. }));
        assert_eq!(store.stack_len("s"), 0);
    }

    #[test]
    fn test_next_event_after_snapshot_starts_from_zero() {
        let (store, storage) = store_with(MockConfigStorage::new().with_config("s", "a"));
        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        store
            .tracker()
            .record("s", PerformanceEvent::Stall, None);
        store
            .tracker()
            .record("s", PerformanceEvent::Stall, None);

        storage.set_config("s", "b");
        let v2 = store
            .snapshot("s", "c2", AgentProvider::Claude, None)
            .unwrap()
            .unwrap();
        let record = store
            .tracker()
            .record("s", PerformanceEvent::Stall, None)
            .unwrap();
        assert_eq!(record.config_version_id, v2.id.as_str());
        assert_eq!(record.stall_count, 1);
    }

    #[test]
    fn test_rollback_restores_previous_content() {
        let (store, storage) = store_with(MockConfigStorage::new().with_config("s", "one"));
        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        storage.set_config("s", "two");
        store.snapshot("s", "c2", AgentProvider::Claude, None).unwrap();
        storage.set_config("s", "three");

        let outcome = store.rollback("s", "manual");
        assert!(outcome.success);
        assert_eq!(outcome.rolled_back_to, Some(1));
        assert_eq!(storage.config("s").as_deref(), Some("one"));
        assert_eq!(store.stack_len("s"), 1);

        let history = store.history("s");
        assert_eq!(history.len(), 2);
        let rolled: Vec<_> = history.iter().filter(|s| s.rolled_back).collect();
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].version, 2);
        assert_eq!(rolled[0].rollback_reason.as_deref(), Some("manual"));
        assert_eq!(store.active("s").unwrap().version, 1);
        assert_eq!(
            store.tracker().current("s").unwrap().config_version_id,
            history[0].id.as_str()
        );
    }

    #[test]
    fn test_rollback_requires_two_versions() {
        let (store, _) = store_with(MockConfigStorage::new().with_config("s", "one"));
        let outcome = store.rollback("s", "r");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("0 version"));

        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        assert!(!store.rollback("s", "r").success);
        assert_eq!(store.stack_len("s"), 1);
    }

    #[test]
    fn test_failed_rollback_write_leaves_state_untouched() {
        let (store, storage) = store_with(MockConfigStorage::new().with_config("s", "one"));
        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        store.snapshot("s", "c2", AgentProvider::Claude, None).unwrap();
        for _ in 0..3 {
            store.tracker().record("s", PerformanceEvent::Stall, None);
        }
        storage.fail_writes(true);

        let outcome = store.rollback("s", "r");
        assert!(!outcome.success);
        assert_eq!(store.stack_len("s"), 2);
        assert!(store.history("s").iter().all(|s| !s.rolled_back));
        assert_eq!(store.tracker().current("s").unwrap().stall_count, 3);
    }

    #[test]
    fn test_version_number_reused_after_rollback() {
        let (store, _) = store_with(MockConfigStorage::new().with_config("s", "x"));
        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        store.snapshot("s", "c2", AgentProvider::Claude, None).unwrap();
        assert!(store.rollback("s", "r").success);
        let again = store
            .snapshot("s", "c3", AgentProvider::Claude, None)
            .unwrap()
            .unwrap();
        assert_eq!(again.version, 2);

        let versions: Vec<(u32, bool)> = store
            .history("s")
            .iter()
            .map(|s| (s.version, s.rolled_back))
            .collect();
        assert_eq!(versions, vec![(1, false), (2, true), (2, false)]);
    }

    #[test]
    fn test_history_survives_restart_with_persistence() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(MockConfigStorage::new().with_config("s", "one"));

        let store = ConfigVersionStore::new(
            Arc::new(MonitoringRegistry::new()),
            Arc::clone(&storage) as Arc<dyn ConfigStorage>,
        )
        .with_persistence(VersionPersistence::new(temp.path()));
        store.snapshot("s", "c1", AgentProvider::Claude, None).unwrap();
        store.snapshot("s", "c2", AgentProvider::Claude, None).unwrap();
        assert!(store.rollback("s", "r").success);
        drop(store);

        let reopened = ConfigVersionStore::new(
            Arc::new(MonitoringRegistry::new()),
            Arc::clone(&storage) as Arc<dyn ConfigStorage>,
        )
        .with_persistence(VersionPersistence::new(temp.path()));
        assert_eq!(reopened.history("s").len(), 2);
        assert_eq!(reopened.stack_len("s"), 1);
        assert!(reopened.tracker().current("s").is_some());
    }
}
