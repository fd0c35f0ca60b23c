//! Shared monitoring state.
//!
//! [`MonitoringRegistry`] owns every map the monitoring components mutate:
//! cooldown timestamps, live performance records, version stacks, optimization
//! records, cached analyses and the per-scope timers. One registry is constructed per process
//! (or per test) and handed to the components by `Arc`, so tearing it down
//! releases all state at once.
//!
//! Every map has its own mutex and operations are always scoped to a single
//! session or scope id. Version stacks additionally carry a per-session lock
//! so that file I/O during snapshot/rollback only serialises work on that
//! session. That lock may be held while a map mutex is taken, never the
//! other way round.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::analysis::SessionAnalysis;
use crate::optimizer::OptimizationRecord;
use crate::performance::PerformanceRecord;
use crate::versions::SessionVersions;

/// Minimum time between two optimization triggers for one session.
pub const OPTIMIZATION_COOLDOWN_SECS: i64 = 5 * 60;

/// Minimum time between two automatic rollbacks for one session.
pub const ROLLBACK_COOLDOWN_SECS: i64 = 10 * 60;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Cooldowns
// ============================================================================

/// Per-key "last fired at" timestamps with a fixed window.
#[derive(Debug)]
pub struct CooldownMap {
    window: Duration,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownMap {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Length of the cooldown window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// True while `key` fired less than one window before `now`.
    #[must_use]
    pub fn is_cooling_down(&self, key: &str, now: DateTime<Utc>) -> bool {
        lock(&self.last_fired)
            .get(key)
            .is_some_and(|last| now - *last < self.window)
    }

    /// Record that `key` fired at `now`.
    pub fn mark(&self, key: &str, now: DateTime<Utc>) {
        lock(&self.last_fired).insert(key.to_string(), now);
    }

    /// Atomically check the window and mark `key` if it is free.
    ///
    /// Returns `false` (and leaves the timestamp alone) while cooling down.
    pub fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut map = lock(&self.last_fired);
        if map.get(key).is_some_and(|last| now - *last < self.window) {
            return false;
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Last time `key` fired, if ever.
    #[must_use]
    pub fn last_fired(&self, key: &str) -> Option<DateTime<Utc>> {
        lock(&self.last_fired).get(key).copied()
    }

    pub fn clear(&self) {
        lock(&self.last_fired).clear();
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process- or test-scoped container for all mutable monitoring state.
pub struct MonitoringRegistry {
    clock: Arc<dyn Clock>,
    pub(crate) optimization_cooldowns: CooldownMap,
    pub(crate) rollback_cooldowns: CooldownMap,
    /// Live record for the active version of each session.
    pub(crate) performance: Mutex<HashMap<String, PerformanceRecord>>,
    /// Final counters of versions that are no longer active.
    pub(crate) performance_archive: Mutex<HashMap<String, Vec<PerformanceRecord>>>,
    pub(crate) versions: Mutex<HashMap<String, Arc<Mutex<SessionVersions>>>>,
    /// Optimization records in creation order.
    pub(crate) optimizations: Mutex<Vec<OptimizationRecord>>,
    pub(crate) optimization_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Optimizations past their last cancellation check and still writing.
    pub(crate) applying: Mutex<HashSet<String>>,
    /// Number of analysis errors already turned into error events.
    pub(crate) seen_errors: Mutex<HashMap<String, usize>>,
    /// Latest analysis per session, refreshed outside the check cycle.
    pub(crate) analyses: Mutex<HashMap<String, SessionAnalysis>>,
    /// Sessions each scope saw on its last cycle.
    pub(crate) scope_members: Mutex<HashMap<String, HashSet<String>>>,
    pub(crate) scope_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Default for MonitoringRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitoringRegistry {
    /// Registry backed by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry backed by a custom clock (tests drive time explicitly).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            optimization_cooldowns: CooldownMap::new(Duration::seconds(
                OPTIMIZATION_COOLDOWN_SECS,
            )),
            rollback_cooldowns: CooldownMap::new(Duration::seconds(ROLLBACK_COOLDOWN_SECS)),
            performance: Mutex::new(HashMap::new()),
            performance_archive: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            optimizations: Mutex::new(Vec::new()),
            optimization_tasks: Mutex::new(HashMap::new()),
            applying: Mutex::new(HashSet::new()),
            seen_errors: Mutex::new(HashMap::new()),
            analyses: Mutex::new(HashMap::new()),
            scope_members: Mutex::new(HashMap::new()),
            scope_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Current time according to the registry clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Cooldown shared by every optimization trigger reason.
    #[must_use]
    pub fn optimization_cooldowns(&self) -> &CooldownMap {
        &self.optimization_cooldowns
    }

    /// Cooldown for automatic rollbacks, independent of optimizations.
    #[must_use]
    pub fn rollback_cooldowns(&self) -> &CooldownMap {
        &self.rollback_cooldowns
    }

    /// Per-session version state, created empty on first access.
    pub(crate) fn session_versions(&self, session_id: &str) -> Arc<Mutex<SessionVersions>> {
        let mut map = lock(&self.versions);
        Arc::clone(
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionVersions::unloaded()))),
        )
    }

    // ------------------------------------------------------------------------
    // Session bookkeeping
    // ------------------------------------------------------------------------

    /// Cached analyses of the given sessions.
    pub(crate) fn cached_analyses<'a>(
        &self,
        session_ids: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, SessionAnalysis> {
        let cache = lock(&self.analyses);
        session_ids
            .into_iter()
            .filter_map(|id| cache.get(id).map(|a| (id.to_string(), a.clone())))
            .collect()
    }

    /// Record the sessions `scope_id` saw on this cycle.
    ///
    /// Sessions that left the scope and are not seen by any other scope
    /// lose their error counts, cached analysis and archived counters.
    /// Returns their ids.
    pub(crate) fn update_scope_members(
        &self,
        scope_id: &str,
        current: HashSet<String>,
    ) -> Vec<String> {
        let departed = {
            let mut members = lock(&self.scope_members);
            let previous = members
                .insert(scope_id.to_string(), current)
                .unwrap_or_default();
            unseen(&members, previous)
        };
        self.forget_sessions(&departed);
        departed
    }

    /// Drop a scope's membership, forgetting sessions only it saw.
    pub(crate) fn forget_scope(&self, scope_id: &str) -> Vec<String> {
        let departed = {
            let mut members = lock(&self.scope_members);
            let previous = members.remove(scope_id).unwrap_or_default();
            unseen(&members, previous)
        };
        self.forget_sessions(&departed);
        departed
    }

    fn forget_sessions(&self, session_ids: &[String]) {
        if session_ids.is_empty() {
            return;
        }
        let mut seen = lock(&self.seen_errors);
        let mut analyses = lock(&self.analyses);
        let mut archive = lock(&self.performance_archive);
        for id in session_ids {
            seen.remove(id);
            analyses.remove(id);
            archive.remove(id);
        }
        debug!("Forgot {} departed session(s)", session_ids.len());
    }

    // ------------------------------------------------------------------------
    // Scope timers
    // ------------------------------------------------------------------------

    /// Install a timer for `scope_id`, aborting any timer it replaces.
    pub(crate) fn replace_timer(&self, scope_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.scope_timers).insert(scope_id.to_string(), handle) {
            debug!("Replacing running timer for scope {}", scope_id);
            previous.abort();
        }
    }

    /// Stop the timer for `scope_id`. Returns whether one was running.
    pub(crate) fn cancel_timer(&self, scope_id: &str) -> bool {
        match lock(&self.scope_timers).remove(scope_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a live timer exists for `scope_id`.
    #[must_use]
    pub fn has_timer(&self, scope_id: &str) -> bool {
        lock(&self.scope_timers)
            .get(scope_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ids of scopes with a running timer.
    #[must_use]
    pub fn active_scopes(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.scope_timers)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Abort every scope timer. In-flight optimization runs are left alone.
    pub fn shutdown(&self) {
        let mut timers = lock(&self.scope_timers);
        for (scope_id, handle) in timers.drain() {
            debug!("Stopping timer for scope {}", scope_id);
            handle.abort();
        }
    }
}

fn unseen(members: &HashMap<String, HashSet<String>>, candidates: HashSet<String>) -> Vec<String> {
    let mut ids: Vec<String> = candidates
        .into_iter()
        .filter(|id| !members.values().any(|seen| seen.contains(id)))
        .collect();
    ids.sort();
    ids
}

impl Drop for MonitoringRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
