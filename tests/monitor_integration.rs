//! End-to-end scenarios through the public monitor API.

use chrono::Duration;
use std::sync::Arc;
use tempfile::TempDir;

use overseer::optimizer::OptimizationJournal;
use overseer::scope::InMemoryScopeStore;
use overseer::testing::{
    MockAnalysisSource, MockClock, MockConfigStorage, MockOptimizer, MockSessionRegistry,
};
use overseer::versions::VersionPersistence;
use overseer::{
    AgentProvider, Monitor, MonitoredScope, MonitoringRegistry, OptimizationStatus,
    OptimizationTrigger, PerformanceEvent, SessionInfo,
};

struct Harness {
    clock: Arc<MockClock>,
    sessions: Arc<MockSessionRegistry>,
    storage: Arc<MockConfigStorage>,
    optimizer: Arc<MockOptimizer>,
    analysis: Arc<MockAnalysisSource>,
    monitor: Arc<Monitor>,
}

fn harness(optimizer: MockOptimizer) -> Harness {
    let clock = Arc::new(MockClock::new());
    let sessions = Arc::new(MockSessionRegistry::new());
    let storage = Arc::new(MockConfigStorage::new());
    let optimizer = Arc::new(optimizer);
    let analysis = Arc::new(MockAnalysisSource::new());
    let monitor = Monitor::builder(
        Arc::new(MonitoringRegistry::with_clock(clock.clone())),
        sessions.clone(),
        Arc::new(InMemoryScopeStore::new()),
        storage.clone(),
    )
    .with_optimizer(optimizer.clone())
    .with_analysis(analysis.clone())
    .build();

    Harness {
        clock,
        sessions,
        storage,
        optimizer,
        analysis,
        monitor,
    }
}

impl Harness {
    fn session(&self, id: &str, idle_minutes: i64) -> SessionInfo {
        let session = SessionInfo::new(id, "owner")
            .with_provider(AgentProvider::Claude)
            .with_last_activity(self.clock.now_utc() - Duration::minutes(idle_minutes));
        self.sessions.add_session(session.clone());
        session
    }
}

// =============================================================================
// Detection
// =============================================================================

#[tokio::test]
async fn test_stalled_sessions_are_reported_and_active_ones_are_not() {
    let h = harness(MockOptimizer::new());
    for minutes in [0, 1, 4, 5, 6, 60] {
        h.session(&format!("idle-{}", minutes), minutes);
    }
    h.sessions.add_session(SessionInfo::new("never", "owner"));
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();

    let result = h.monitor.check_for_stalled_sessions(&scope.id).await.unwrap();
    let mut stalled: Vec<&str> = result
        .stalled_sessions
        .iter()
        .map(|s| s.session.id.as_str())
        .collect();
    stalled.sort_unstable();
    assert_eq!(stalled, vec!["idle-5", "idle-6", "idle-60", "never"]);
    assert_eq!(result.checked_sessions, 7);
}

#[tokio::test]
async fn test_folder_scope_without_reference_checks_nothing() {
    let h = harness(MockOptimizer::new());
    h.sessions
        .add_session(SessionInfo::new("s", "owner").with_folder("f1"));

    // Creation rejects it, so plant one in the store directly.
    let mut scope = MonitoredScope::folder("owner", "f1");
    scope.scope_ref = None;
    assert!(h.monitor.create_scope(scope.clone()).is_err());

    let store = InMemoryScopeStore::new();
    overseer::ScopeStore::put(&store, scope.clone()).unwrap();
    let monitor = Monitor::builder(
        Arc::new(MonitoringRegistry::with_clock(h.clock.clone())),
        h.sessions.clone(),
        Arc::new(store),
        h.storage.clone(),
    )
    .build();

    let result = monitor.check_for_stalled_sessions(&scope.id).await.unwrap();
    assert!(result.stalled_sessions.is_empty());
    assert_eq!(result.checked_sessions, 0);
}

// =============================================================================
// Versions and tracking
// =============================================================================

#[tokio::test]
async fn test_first_snapshot_is_version_one_with_zeroed_tracker() {
    let h = harness(MockOptimizer::new());
    h.storage.set_config("s", "initial");
    let store = h.monitor.version_store();

    let snapshot = store
        .snapshot("s", "cfg-1", AgentProvider::Claude, Some(0.85))
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.content, "initial");

    let record = store.tracker().current("s").unwrap();
    assert_eq!(record.config_version_id, snapshot.id.as_str());
    assert_eq!(record.total_events(), 0);
    assert!(!record.degradation_detected);
}

#[tokio::test]
async fn test_events_follow_the_active_version() {
    let h = harness(MockOptimizer::new());
    h.storage.set_config("s", "v1");
    let store = h.monitor.version_store();

    store.snapshot("s", "a", AgentProvider::Claude, None).unwrap();
    h.monitor.record_session_event("s", PerformanceEvent::Stall, None);
    h.monitor.record_session_event("s", PerformanceEvent::Stall, None);

    let second = store
        .snapshot("s", "b", AgentProvider::Claude, None)
        .unwrap()
        .unwrap();
    let record = h
        .monitor
        .record_session_event("s", PerformanceEvent::Error, None)
        .unwrap();
    assert_eq!(record.config_version_id, second.id.as_str());
    assert_eq!((record.stall_count, record.error_count), (0, 1));
}

#[tokio::test]
async fn test_rollback_restores_prior_snapshot_content() {
    let h = harness(MockOptimizer::new());
    h.storage.set_config("s", "first");
    let store = h.monitor.version_store();
    store.snapshot("s", "a", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "second");
    store.snapshot("s", "b", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "third");
    store.snapshot("s", "c", AgentProvider::Claude, None).unwrap();

    let outcome = h.monitor.rollback_config("s", "operator");
    assert!(outcome.success);
    assert_eq!(outcome.rolled_back_to, Some(2));
    assert_eq!(h.storage.config("s").as_deref(), Some("second"));
    assert_eq!(store.stack_len("s"), 2);

    let history = h.monitor.get_config_version_history("s");
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|s| s.rolled_back).count(), 1);
    assert_eq!(history[2].rollback_reason.as_deref(), Some("operator"));
}

#[tokio::test]
async fn test_failed_rollback_leaves_state_untouched() {
    let h = harness(MockOptimizer::new());
    h.storage.set_config("s", "first");
    let store = h.monitor.version_store();
    store.snapshot("s", "a", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "second");
    store.snapshot("s", "b", AgentProvider::Claude, None).unwrap();
    h.monitor.record_session_event("s", PerformanceEvent::Stall, None);

    h.storage.fail_writes(true);
    let outcome = h.monitor.rollback_config("s", "operator");
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
    assert_eq!(store.stack_len("s"), 2);
    assert_eq!(store.tracker().current("s").unwrap().stall_count, 1);
    assert!(h
        .monitor
        .get_config_version_history("s")
        .iter()
        .all(|s| !s.rolled_back));
}

// =============================================================================
// Rollback gate
// =============================================================================

#[tokio::test]
async fn test_single_version_is_never_rolled_back() {
    let h = harness(MockOptimizer::new().with_score(0.2));
    let session = h.session("s", 10);
    h.storage.set_config("s", "only");
    h.monitor
        .version_store()
        .snapshot("s", "a", AgentProvider::Claude, None)
        .unwrap();
    for _ in 0..10 {
        h.monitor.record_session_event(&session.id, PerformanceEvent::Error, None);
    }
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();

    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert!(report.rolled_back.is_empty());
    assert_eq!(h.monitor.version_store().stack_len("s"), 1);
    h.monitor.wait_for_optimizations().await;
}

#[tokio::test]
async fn test_degraded_second_version_rolls_back_once_per_cooldown() {
    let h = harness(MockOptimizer::new().with_score(0.2));
    h.session("s", 10);
    let store = h.monitor.version_store();
    h.storage.set_config("s", "v1");
    store.snapshot("s", "a", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "v2");
    store.snapshot("s", "b", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "v3");
    store.snapshot("s", "c", AgentProvider::Claude, None).unwrap();
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();

    // Three stalled cycles degrade v3; the third rolls it back to v2.
    for _ in 0..2 {
        let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
        assert!(report.rolled_back.is_empty());
        h.clock.advance(Duration::seconds(30));
    }
    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert_eq!(report.rolled_back, vec!["s".to_string()]);
    assert_eq!(store.active("s").unwrap().version, 2);

    // v2 degrades quickly but the rollback cooldown holds.
    for _ in 0..3 {
        h.monitor.record_session_event("s", PerformanceEvent::Stall, None);
    }
    h.clock.advance(Duration::minutes(5));
    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert!(report.rolled_back.is_empty());
    assert_eq!(store.stack_len("s"), 2);

    h.clock.advance(Duration::minutes(6));
    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert_eq!(report.rolled_back, vec!["s".to_string()]);
    assert_eq!(store.active("s").unwrap().version, 1);
    h.monitor.wait_for_optimizations().await;
}

#[tokio::test]
async fn test_degraded_version_two_rolls_back_to_one() {
    let h = harness(MockOptimizer::new());
    h.session("s", 10);
    let store = h.monitor.version_store();
    h.storage.set_config("s", "v1");
    store.snapshot("s", "a", AgentProvider::Claude, None).unwrap();
    h.storage.set_config("s", "v2");
    store.snapshot("s", "b", AgentProvider::Claude, None).unwrap();
    for _ in 0..3 {
        h.monitor.record_session_event("s", PerformanceEvent::Stall, None);
    }
    assert!(store.tracker().is_degraded("s"));

    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();
    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert_eq!(report.rolled_back, vec!["s".to_string()]);
    assert_eq!(store.active("s").unwrap().version, 1);
    assert_eq!(h.storage.config("s").as_deref(), Some("v1"));
    assert!(report.triggered.is_empty());
}

// =============================================================================
// Optimization
// =============================================================================

#[tokio::test]
async fn test_good_score_applies_configuration() {
    let h = harness(
        MockOptimizer::new()
            .with_score(0.9)
            .with_config("cfg-2", "# Improved instructions"),
    );
    h.session("s", 10);
    h.storage.set_config("s", "# Original instructions");
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();

    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert_eq!(report.triggered.len(), 1);
    h.monitor.wait_for_optimizations().await;

    let record = h.monitor.coordinator().get(&report.triggered[0].id).unwrap();
    assert_eq!(record.status, OptimizationStatus::Completed);
    assert!(record.config_applied);
    assert_eq!(record.final_score, Some(0.9));

    let history = h.monitor.get_config_version_history("s");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].content, "# Original instructions");
    assert_eq!(h.storage.config("s").as_deref(), Some("# Improved instructions"));
}

#[tokio::test]
async fn test_poor_score_applies_nothing() {
    let h = harness(MockOptimizer::new().with_score(0.5).with_config("cfg-2", "meh"));
    h.session("s", 10);
    h.storage.set_config("s", "original");
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();

    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    h.monitor.wait_for_optimizations().await;

    let record = h.monitor.coordinator().get(&report.triggered[0].id).unwrap();
    assert_eq!(record.status, OptimizationStatus::Completed);
    assert!(!record.config_applied);
    assert!(h.monitor.get_config_version_history("s").is_empty());
    assert_eq!(h.storage.config("s").as_deref(), Some("original"));
}

#[tokio::test]
async fn test_triggers_are_rate_limited_per_session() {
    let h = harness(MockOptimizer::new().with_score(0.1));
    let session = h.session("s", 10);
    let coordinator = h.monitor.coordinator();

    assert!(coordinator.trigger_for_stall(&session, None, None).is_some());
    h.clock.advance(Duration::minutes(4));
    assert!(coordinator.trigger_for_stall(&session, None, None).is_none());

    let analysis = overseer::analysis::SessionAnalysis {
        errors_encountered: vec!["a".into(), "b".into(), "c".into()],
        ..Default::default()
    };
    assert!(coordinator
        .trigger_for_error_pattern(&session, None, analysis)
        .is_none());

    h.clock.advance(Duration::minutes(2));
    assert!(coordinator.trigger_for_stall(&session, None, None).is_some());
    h.monitor.wait_for_optimizations().await;
    assert_eq!(h.optimizer.calls(), 2);
}

#[tokio::test]
async fn test_optimizer_failure_is_recorded_not_raised() {
    let h = harness(MockOptimizer::new().failing("model overloaded"));
    h.session("s", 10);
    h.analysis.set_analysis(
        "s",
        overseer::analysis::SessionAnalysis {
            errors_encountered: vec!["e1".into(), "e2".into(), "e3".into()],
            language: Some("rust".into()),
            ..Default::default()
        },
    );
    let scope = h.monitor.create_scope(MonitoredScope::master("owner")).unwrap();
    assert_eq!(h.monitor.refresh_analyses(&scope.id).await.unwrap(), 1);

    let report = h.monitor.run_check_cycle(&scope.id).await.unwrap();
    assert_eq!(report.triggered[0].trigger, OptimizationTrigger::ErrorPattern);
    h.monitor.wait_for_optimizations().await;

    let history = h.monitor.get_optimization_history(Some("s"), Some(&scope.id), 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, OptimizationStatus::Failed);
    assert!(history[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("model overloaded")));

    let request = h.optimizer.last_request().unwrap();
    assert_eq!(request.context.language.as_deref(), Some("rust"));
}

#[tokio::test]
async fn test_cancel_pending_optimization() {
    let h = harness(MockOptimizer::new().with_delay(std::time::Duration::from_secs(5)));
    h.session("s", 10);

    let record = h.monitor.trigger_optimization("s").await.unwrap().unwrap();
    let cancelled = h.monitor.cancel_optimization(&record.id).unwrap();
    assert_eq!(cancelled.status, OptimizationStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
    assert!(h.monitor.cancel_optimization(&record.id).is_err());

    h.monitor.wait_for_optimizations().await;
    assert_eq!(
        h.monitor.coordinator().get(&record.id).unwrap().status,
        OptimizationStatus::Failed
    );
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_history_survives_restart() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(MockClock::new());
    let sessions = Arc::new(MockSessionRegistry::new());
    sessions.add_session(
        SessionInfo::new("s", "owner")
            .with_provider(AgentProvider::Codex)
            .with_last_activity(clock.now_utc() - Duration::minutes(10)),
    );
    let storage = Arc::new(MockConfigStorage::new().with_config("s", "original"));

    let build = |optimizer: MockOptimizer| {
        Monitor::builder(
            Arc::new(MonitoringRegistry::with_clock(clock.clone())),
            sessions.clone(),
            Arc::new(InMemoryScopeStore::new()),
            storage.clone(),
        )
        .with_optimizer(Arc::new(optimizer))
        .with_persistence(VersionPersistence::new(temp.path().join("versions")))
        .with_journal(OptimizationJournal::new(temp.path().join("optimizations.jsonl")))
        .build()
    };

    let first = build(MockOptimizer::new().with_score(0.95).with_config("cfg", "better"));
    first.trigger_optimization("s").await.unwrap().unwrap();
    first.wait_for_optimizations().await;
    drop(first);

    let second = build(MockOptimizer::new());
    let versions = second.get_config_version_history("s");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].content, "original");
    assert_eq!(versions[0].provider, AgentProvider::Codex);

    let attempts = second.get_optimization_history(Some("s"), None, 10);
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].config_applied);
    assert_eq!(attempts[0].trigger, OptimizationTrigger::Manual);
}
