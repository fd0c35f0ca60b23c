//! The monitor: one entry point over detection, tracking, rollback and
//! optimization.
//!
//! [`Monitor`] owns the components and wires them to one
//! [`MonitoringRegistry`]. Timers, the per-scope check cycle and the
//! reactions to stalled sessions live in [`cycle`]; this module holds
//! construction, scope management and queries.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use overseer::monitor::Monitor;
//! use overseer::registry::MonitoringRegistry;
//! use overseer::scope::{InMemoryScopeStore, MonitoredScope};
//! use overseer::testing::{MockConfigStorage, MockSessionRegistry};
//!
//! # async fn run() -> overseer::error::Result<()> {
//! let monitor = Monitor::builder(
//!     Arc::new(MonitoringRegistry::new()),
//!     Arc::new(MockSessionRegistry::new()),
//!     Arc::new(InMemoryScopeStore::new()),
//!     Arc::new(MockConfigStorage::new()),
//! )
//! .build();
//!
//! let scope = monitor.create_scope(MonitoredScope::master("user-1"))?;
//! monitor.start_monitoring(&scope.id)?;
//! # Ok(())
//! # }
//! ```

pub mod cycle;

pub use cycle::CycleReport;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::analysis::{AnalysisSource, FileAnalysisSource, SessionAnalysis};
use crate::config::{DetectionStrategy, MonitorSettings};
use crate::detector::{
    ContentDiffStrategy, Diagnosis, StallCheckResult, StallDetector, StallStrategy, StalledSession,
};
use crate::error::{IntoOverseerError, OverseerError, Result};
use crate::optimizer::{
    CommandOptimizer, DisabledOptimizer, OptimizationCoordinator, OptimizationJournal,
    OptimizationRecord, OptimizerClient, OptimizerOptions,
};
use crate::performance::{PerformanceEvent, PerformanceRecord};
use crate::registry::MonitoringRegistry;
use crate::scope::{JsonScopeStore, MonitoredScope, ScopeStatus, ScopeStore};
use crate::session::{
    DiagnosticCapture, FileSessionRegistry, SessionInfo, SessionRegistry, TmuxCapture,
};
use crate::storage::{ConfigStorage, FsConfigStorage};
use crate::versions::{
    ConfigVersionSnapshot, ConfigVersionStore, RollbackController, RollbackOutcome,
    VersionPersistence,
};

/// Counters of one version next to its optimizer score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPerformance {
    pub version: u32,
    pub snapshot_id: String,
    pub score: Option<f64>,
    pub stall_count: u32,
    pub error_count: u32,
    pub success_count: u32,
    pub degraded: bool,
    pub rolled_back: bool,
    /// Currently on top of the stack.
    pub active: bool,
}

/// Facade over the monitoring components.
pub struct Monitor {
    registry: Arc<MonitoringRegistry>,
    sessions: Arc<dyn SessionRegistry>,
    scopes: Arc<dyn ScopeStore>,
    detector: StallDetector,
    store: Arc<ConfigVersionStore>,
    rollback: RollbackController,
    coordinator: OptimizationCoordinator,
    analysis: Option<Arc<dyn AnalysisSource>>,
    default_stall_threshold: Option<u64>,
}

/// Builder for [`Monitor`].
pub struct MonitorBuilder {
    registry: Arc<MonitoringRegistry>,
    sessions: Arc<dyn SessionRegistry>,
    scopes: Arc<dyn ScopeStore>,
    storage: Arc<dyn ConfigStorage>,
    optimizer: Arc<dyn OptimizerClient>,
    options: OptimizerOptions,
    strategy: Option<Arc<dyn StallStrategy>>,
    capture: Option<Arc<dyn DiagnosticCapture>>,
    analysis: Option<Arc<dyn AnalysisSource>>,
    persistence: Option<VersionPersistence>,
    journal: Option<OptimizationJournal>,
    default_stall_threshold: Option<u64>,
}

impl MonitorBuilder {
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<dyn OptimizerClient>) -> Self {
        self.optimizer = optimizer;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: OptimizerOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the timestamp strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn StallStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn DiagnosticCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    #[must_use]
    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisSource>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: VersionPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: OptimizationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Threshold given to scopes created without one.
    #[must_use]
    pub fn with_default_stall_threshold(mut self, seconds: u64) -> Self {
        self.default_stall_threshold = Some(seconds);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Monitor> {
        let mut store = ConfigVersionStore::new(Arc::clone(&self.registry), self.storage);
        if let Some(persistence) = self.persistence {
            store = store.with_persistence(persistence);
        }
        let store = Arc::new(store);

        let mut detector =
            StallDetector::new(Arc::clone(&self.registry), Arc::clone(&self.sessions));
        if let Some(strategy) = self.strategy {
            detector = detector.with_strategy(strategy);
        }
        if let Some(capture) = self.capture {
            detector = detector.with_capture(capture);
        }

        let mut coordinator = OptimizationCoordinator::new(
            Arc::clone(&self.registry),
            Arc::clone(&store),
            self.optimizer,
        )
        .with_options(self.options);
        if let Some(journal) = self.journal {
            coordinator = coordinator.with_journal(journal);
        }

        Arc::new(Monitor {
            rollback: RollbackController::new(Arc::clone(&self.registry), Arc::clone(&store)),
            registry: self.registry,
            sessions: self.sessions,
            scopes: self.scopes,
            detector,
            store,
            coordinator,
            analysis: self.analysis,
            default_stall_threshold: self.default_stall_threshold,
        })
    }
}

impl Monitor {
    /// Start building a monitor. Optimization is disabled until an optimizer
    /// is supplied.
    #[must_use]
    pub fn builder(
        registry: Arc<MonitoringRegistry>,
        sessions: Arc<dyn SessionRegistry>,
        scopes: Arc<dyn ScopeStore>,
        storage: Arc<dyn ConfigStorage>,
    ) -> MonitorBuilder {
        MonitorBuilder {
            registry,
            sessions,
            scopes,
            storage,
            optimizer: Arc::new(DisabledOptimizer),
            options: OptimizerOptions::default(),
            strategy: None,
            capture: None,
            analysis: None,
            persistence: None,
            journal: None,
            default_stall_threshold: None,
        }
    }

    /// Monitor over the files of a project's data directory.
    ///
    /// Sessions come from the backend's session table, scopes and histories
    /// are stored next to it, terminals are captured through tmux.
    #[must_use]
    pub fn open(project_dir: &Path, settings: &MonitorSettings) -> Arc<Self> {
        let sessions: Arc<dyn SessionRegistry> = Arc::new(FileSessionRegistry::new(
            MonitorSettings::sessions_path(project_dir),
        ));
        let capture: Arc<dyn DiagnosticCapture> = Arc::new(TmuxCapture::new());
        let optimizer: Arc<dyn OptimizerClient> =
            match CommandOptimizer::from_settings(&settings.optimizer) {
                Some(command) => Arc::new(command.with_working_dir(project_dir)),
                None => Arc::new(DisabledOptimizer),
            };

        let mut builder = Self::builder(
            Arc::new(MonitoringRegistry::new()),
            Arc::clone(&sessions),
            Arc::new(JsonScopeStore::new(MonitorSettings::scopes_path(project_dir))),
            Arc::new(FsConfigStorage::new(Arc::clone(&sessions))),
        )
        .with_optimizer(optimizer)
        .with_options(OptimizerOptions::from(&settings.optimizer))
        .with_capture(Arc::clone(&capture))
        .with_analysis(Arc::new(FileAnalysisSource::new(
            MonitorSettings::analysis_dir(project_dir),
        )))
        .with_default_stall_threshold(settings.default_stall_threshold_seconds);

        if settings.strategy == DetectionStrategy::ContentDiff {
            builder = builder.with_strategy(Arc::new(ContentDiffStrategy::new(capture)));
        }
        if settings.persist_history {
            builder = builder
                .with_persistence(VersionPersistence::new(MonitorSettings::versions_dir(
                    project_dir,
                )))
                .with_journal(OptimizationJournal::new(MonitorSettings::optimizations_log(
                    project_dir,
                )));
        }
        builder.build()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MonitoringRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn version_store(&self) -> &Arc<ConfigVersionStore> {
        &self.store
    }

    #[must_use]
    pub fn coordinator(&self) -> &OptimizationCoordinator {
        &self.coordinator
    }

    // ------------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------------

    /// Validate and store a new scope.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::InvalidScope`] for unusable definitions.
    pub fn create_scope(&self, mut scope: MonitoredScope) -> Result<MonitoredScope> {
        scope.validate()?;
        if scope.stall_threshold_seconds.is_none() {
            scope.stall_threshold_seconds = self.default_stall_threshold;
        }
        scope.status = ScopeStatus::Idle;
        self.scopes.put(scope.clone())?;
        info!("Created scope {}", scope.summary());
        Ok(scope)
    }

    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids.
    pub fn scope(&self, scope_id: &str) -> Result<MonitoredScope> {
        self.scopes
            .get(scope_id)?
            .ok_or_else(|| OverseerError::scope_not_found(scope_id))
    }

    /// # Errors
    ///
    /// Returns an error if the scope store cannot be read.
    pub fn list_scopes(&self, owner_id: Option<&str>) -> Result<Vec<MonitoredScope>> {
        Ok(self.scopes.list(owner_id)?)
    }

    /// Stop the scope's timer and mark it paused.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids.
    pub fn pause_scope(&self, scope_id: &str) -> Result<MonitoredScope> {
        self.registry.cancel_timer(scope_id);
        let scope = self.set_status(scope_id, ScopeStatus::Paused)?;
        info!("Paused scope {}", scope_id);
        Ok(scope)
    }

    /// Mark a paused scope idle again. The timer is not restarted.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids.
    pub fn resume_scope(&self, scope_id: &str) -> Result<MonitoredScope> {
        let scope = self.set_status(scope_id, ScopeStatus::Idle)?;
        info!("Resumed scope {}", scope_id);
        Ok(scope)
    }

    /// Stop monitoring and remove the scope. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope store cannot be written.
    pub fn delete_scope(&self, scope_id: &str) -> Result<bool> {
        self.registry.cancel_timer(scope_id);
        let existed = self.scopes.delete(scope_id)?;
        self.registry.forget_scope(scope_id);
        if existed {
            info!("Deleted scope {}", scope_id);
        }
        Ok(existed)
    }

    pub(crate) fn set_status(&self, scope_id: &str, status: ScopeStatus) -> Result<MonitoredScope> {
        self.scopes
            .set_status(scope_id, status)?
            .ok_or_else(|| OverseerError::scope_not_found(scope_id))
    }

    /// Move to `status` only from one of `from`; returns the scope as stored.
    pub(crate) fn set_status_if(
        &self,
        scope_id: &str,
        from: &[ScopeStatus],
        status: ScopeStatus,
    ) -> Result<MonitoredScope> {
        self.scopes
            .set_status_if(scope_id, from, status)?
            .ok_or_else(|| OverseerError::scope_not_found(scope_id))
    }

    // ------------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------------

    /// Stalled sessions of a scope, without reacting to them.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids and
    /// [`OverseerError::Registry`] if sessions cannot be listed.
    pub async fn check_for_stalled_sessions(&self, scope_id: &str) -> Result<StallCheckResult> {
        let scope = self.scope(scope_id)?;
        self.detector.check(&scope).await
    }

    /// Capture the terminal of a session that is stalled right now.
    ///
    /// Returns `Ok(None)` for a session that is still active; active
    /// sessions are never captured. The threshold is the smallest one among
    /// the scopes observing the session.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::SessionNotFound`] for unknown sessions.
    pub async fn diagnose(&self, session_id: &str) -> Result<Option<Diagnosis>> {
        let session = self.session(session_id)?;
        let threshold = self
            .scopes
            .list(Some(&session.owner_id))?
            .iter()
            .filter(|scope| scope.observes(&session))
            .map(MonitoredScope::stall_threshold)
            .min()
            .unwrap_or_else(|| {
                let mut fallback = MonitoredScope::master(&session.owner_id);
                fallback.stall_threshold_seconds = self.default_stall_threshold;
                fallback.stall_threshold()
            });

        let Some(reason) = self.detector.classify_now(&session, threshold)? else {
            debug!("Session {} is active, not capturing", session.label());
            return Ok(None);
        };
        let diagnosis = self
            .detector
            .diagnose(&StalledSession { session, reason })
            .await?;
        Ok(Some(diagnosis))
    }

    pub(crate) fn session(&self, session_id: &str) -> Result<SessionInfo> {
        self.sessions
            .get_session(session_id)
            .into_registry_error()?
            .ok_or_else(|| OverseerError::session_not_found(session_id))
    }

    pub(crate) async fn analyze(&self, session: &SessionInfo) -> Option<SessionAnalysis> {
        let source = self.analysis.as_ref()?;
        match source.analyze(session).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!("Analysis unavailable for session {}: {:#}", session.label(), e);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Performance and versions
    // ------------------------------------------------------------------------

    /// Report an event for the session's active version.
    pub fn record_session_event(
        &self,
        session_id: &str,
        event: PerformanceEvent,
        response_time_ms: Option<f64>,
    ) -> Option<PerformanceRecord> {
        self.store.tracker().record(session_id, event, response_time_ms)
    }

    /// Versions ascending, rolled-back ones included.
    #[must_use]
    pub fn get_config_version_history(&self, session_id: &str) -> Vec<ConfigVersionSnapshot> {
        self.store.history(session_id)
    }

    /// Per-version counters next to the score each version was created with.
    #[must_use]
    pub fn get_performance_correlation(&self, session_id: &str) -> Vec<VersionPerformance> {
        let active = self.store.active(session_id).map(|s| s.id);
        let tracker = self.store.tracker();
        self.store
            .history(session_id)
            .into_iter()
            .map(|snapshot| {
                let counters = tracker
                    .for_version(session_id, snapshot.id.as_str())
                    .unwrap_or_else(|| PerformanceRecord::new(session_id, snapshot.id.as_str()));
                VersionPerformance {
                    version: snapshot.version,
                    score: snapshot.score,
                    stall_count: counters.stall_count,
                    error_count: counters.error_count,
                    success_count: counters.success_count,
                    degraded: counters.degradation_detected,
                    rolled_back: snapshot.rolled_back,
                    active: active.as_ref() == Some(&snapshot.id),
                    snapshot_id: snapshot.id.to_string(),
                }
            })
            .collect()
    }

    /// Operator rollback to the previous version.
    #[must_use]
    pub fn rollback_config(&self, session_id: &str, reason: &str) -> RollbackOutcome {
        self.rollback.rollback_now(session_id, reason)
    }

    // ------------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------------

    /// Manually optimize a session, ignoring the cooldown.
    ///
    /// Returns `Ok(None)` when the session runs no agent.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::SessionNotFound`] for unknown sessions.
    pub async fn trigger_optimization(
        &self,
        session_id: &str,
    ) -> Result<Option<OptimizationRecord>> {
        let session = self.session(session_id)?;
        let analysis = self.analyze(&session).await;
        Ok(self.coordinator.trigger_manual(&session, analysis))
    }

    /// # Errors
    ///
    /// Returns [`OverseerError::OptimizationNotFound`] or
    /// [`OverseerError::InvalidTransition`] for finished attempts.
    pub fn cancel_optimization(&self, id: &str) -> Result<OptimizationRecord> {
        self.coordinator.cancel(id)
    }

    /// Attempts newest first.
    #[must_use]
    pub fn get_optimization_history(
        &self,
        session_id: Option<&str>,
        scope_id: Option<&str>,
        limit: usize,
    ) -> Vec<OptimizationRecord> {
        self.coordinator.history(session_id, scope_id, limit)
    }

    /// Wait for every detached optimization to finish.
    pub async fn wait_for_optimizations(&self) {
        self.coordinator.wait_idle().await;
    }

    /// Stop every scope timer. Running optimizations are left to finish.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        info!("Monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AgentProvider;
    use crate::scope::InMemoryScopeStore;
    use crate::testing::{MockCapture, MockClock, MockConfigStorage, MockSessionRegistry};
    use chrono::Duration;

    struct Fixture {
        clock: Arc<MockClock>,
        sessions: Arc<MockSessionRegistry>,
        storage: Arc<MockConfigStorage>,
        capture: Arc<MockCapture>,
        monitor: Arc<Monitor>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MockClock::new());
        let registry = Arc::new(MonitoringRegistry::with_clock(clock.clone()));
        let sessions = Arc::new(MockSessionRegistry::new());
        let storage = Arc::new(MockConfigStorage::new());
        let capture = Arc::new(MockCapture::new());
        let monitor = Monitor::builder(
            registry,
            sessions.clone(),
            Arc::new(InMemoryScopeStore::new()),
            storage.clone(),
        )
        .with_capture(capture.clone())
        .build();
        Fixture {
            clock,
            sessions,
            storage,
            capture,
            monitor,
        }
    }

    #[test]
    fn test_create_scope_validates_and_applies_default_threshold() {
        let clock = Arc::new(MockClock::new());
        let monitor = Monitor::builder(
            Arc::new(MonitoringRegistry::with_clock(clock)),
            Arc::new(MockSessionRegistry::new()),
            Arc::new(InMemoryScopeStore::new()),
            Arc::new(MockConfigStorage::new()),
        )
        .with_default_stall_threshold(120)
        .build();

        let scope = monitor.create_scope(MonitoredScope::master("u")).unwrap();
        assert_eq!(scope.stall_threshold_seconds, Some(120));
        assert_eq!(monitor.scope(&scope.id).unwrap(), scope);

        let mut broken = MonitoredScope::folder("u", "f");
        broken.scope_ref = None;
        let err = monitor.create_scope(broken).unwrap_err();
        assert!(matches!(err, OverseerError::InvalidScope { .. }));
    }

    #[test]
    fn test_scope_lifecycle() {
        let f = fixture();
        let scope = f.monitor.create_scope(MonitoredScope::master("u")).unwrap();

        assert_eq!(
            f.monitor.pause_scope(&scope.id).unwrap().status,
            ScopeStatus::Paused
        );
        assert_eq!(
            f.monitor.resume_scope(&scope.id).unwrap().status,
            ScopeStatus::Idle
        );
        assert!(f.monitor.delete_scope(&scope.id).unwrap());
        assert!(!f.monitor.delete_scope(&scope.id).unwrap());
        assert!(matches!(
            f.monitor.scope(&scope.id),
            Err(OverseerError::ScopeNotFound { .. })
        ));
        assert!(f.monitor.pause_scope("missing").is_err());
    }

    #[tokio::test]
    async fn test_check_unknown_scope() {
        let f = fixture();
        let err = f
            .monitor
            .check_for_stalled_sessions("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, OverseerError::ScopeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_diagnose_only_captures_stalled_sessions() {
        let f = fixture();
        let now = f.clock.now_utc();
        f.sessions.add_session(
            SessionInfo::new("active", "u")
                .with_terminal_ref("pane-a")
                .with_last_activity(now),
        );
        f.sessions.add_session(
            SessionInfo::new("stuck", "u")
                .with_terminal_ref("pane-s")
                .with_last_activity(now - Duration::minutes(10)),
        );
        f.capture.set_text("pane-a", "busy");
        f.capture.set_text("pane-s", "waiting for input");

        assert!(f.monitor.diagnose("active").await.unwrap().is_none());
        assert_eq!(f.capture.calls(), 0);

        let diagnosis = f.monitor.diagnose("stuck").await.unwrap().unwrap();
        assert_eq!(diagnosis.text.as_deref(), Some("waiting for input"));
        assert_eq!(f.capture.calls(), 1);

        assert!(matches!(
            f.monitor.diagnose("ghost").await,
            Err(OverseerError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_diagnose_uses_scope_threshold() {
        let f = fixture();
        let now = f.clock.now_utc();
        f.sessions.add_session(
            SessionInfo::new("s", "u")
                .with_terminal_ref("pane")
                .with_last_activity(now - Duration::seconds(90)),
        );
        assert!(f.monitor.diagnose("s").await.unwrap().is_none());

        f.monitor
            .create_scope(MonitoredScope::master("u").with_stall_threshold(60))
            .unwrap();
        assert!(f.monitor.diagnose("s").await.unwrap().is_some());
    }

    #[test]
    fn test_performance_correlation_spans_versions() {
        let f = fixture();
        f.storage.set_config("s", "v1");
        let store = f.monitor.version_store();

        let first = store
            .snapshot("s", "cfg-1", AgentProvider::Claude, Some(0.75))
            .unwrap()
            .unwrap();
        f.monitor
            .record_session_event("s", PerformanceEvent::Stall, None);
        f.monitor
            .record_session_event("s", PerformanceEvent::Success, Some(120.0));

        let second = store
            .snapshot("s", "cfg-2", AgentProvider::Claude, Some(0.9))
            .unwrap()
            .unwrap();
        f.monitor
            .record_session_event("s", PerformanceEvent::Error, None);

        let rows = f.monitor.get_performance_correlation("s");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].snapshot_id, first.id.to_string());
        assert_eq!((rows[0].stall_count, rows[0].success_count), (1, 1));
        assert!(!rows[0].active);
        assert_eq!(rows[1].snapshot_id, second.id.to_string());
        assert_eq!(rows[1].error_count, 1);
        assert_eq!(rows[1].score, Some(0.9));
        assert!(rows[1].active);
    }

    #[test]
    fn test_rollback_config_reports_unavailable() {
        let f = fixture();
        let outcome = f.monitor.rollback_config("s", "operator");
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_trigger_optimization_requires_known_session() {
        let f = fixture();
        assert!(matches!(
            f.monitor.trigger_optimization("ghost").await,
            Err(OverseerError::SessionNotFound { .. })
        ));

        f.sessions.add_session(SessionInfo::new("plain", "u"));
        assert!(f.monitor.trigger_optimization("plain").await.unwrap().is_none());
    }
}
