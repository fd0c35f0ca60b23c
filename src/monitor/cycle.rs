//! Per-scope timers and the check cycle.
//!
//! A cycle checks one scope and reacts to what it finds:
//!
//! 1. every stalled session gets a stall event on its active version
//! 2. errors reported by the analysis since the last cycle become error events
//! 3. a degraded session with an older version is rolled back, and nothing
//!    else happens to it this cycle
//! 4. otherwise an optimization is requested: `poor_performance` when the
//!    only version is degraded, `error_pattern` when enough errors are
//!    unfixed, `stall_detected` for a plain stall
//!
//! A cycle only reads timestamps and in-memory state. Analysis payloads are
//! fetched by [`Monitor::refresh_analyses`], which timers run in the
//! background after each cycle. Optimizations run detached; the cycle only
//! schedules them.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Monitor;
use crate::analysis::SessionAnalysis;
use crate::detector::StallCheckResult;
use crate::error::{OverseerError, Result};
use crate::optimizer::OptimizationRecord;
use crate::performance::PerformanceEvent;
use crate::registry::lock;
use crate::scope::{MonitoredScope, ScopeStatus};
use crate::session::SessionInfo;

/// What one cycle found and did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub scope_id: String,
    /// The scope was paused; nothing was checked.
    pub skipped: bool,
    pub check: Option<StallCheckResult>,
    /// Sessions whose analysis reported new errors.
    pub errored_sessions: Vec<String>,
    pub rolled_back: Vec<String>,
    pub triggered: Vec<OptimizationRecord>,
}

impl CycleReport {
    fn new(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            skipped: false,
            check: None,
            errored_sessions: Vec::new(),
            rolled_back: Vec::new(),
            triggered: Vec::new(),
        }
    }

    #[must_use]
    pub fn stalled_count(&self) -> usize {
        self.check
            .as_ref()
            .map_or(0, |check| check.stalled_sessions.len())
    }

    #[must_use]
    pub fn summary(&self) -> String {
        if self.skipped {
            return format!("scope {} paused, skipped", self.scope_id);
        }
        format!(
            "scope {}: {} stalled, {} with new errors, {} rolled back, {} optimization(s) started",
            self.scope_id,
            self.stalled_count(),
            self.errored_sessions.len(),
            self.rolled_back.len(),
            self.triggered.len()
        )
    }
}

impl Monitor {
    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Run [`run_check_cycle`](Self::run_check_cycle) for the scope every
    /// tick interval, replacing any timer already running for it.
    ///
    /// Must be called from within a Tokio runtime. The timer holds only a
    /// weak reference, so dropping the monitor ends it.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids and
    /// [`OverseerError::InvalidScope`] for paused scopes.
    pub fn start_monitoring(self: &Arc<Self>, scope_id: &str) -> Result<()> {
        let scope = self.scope(scope_id)?;
        if scope.is_paused() {
            return Err(OverseerError::invalid_scope(
                scope_id,
                "scope is paused, resume it first",
            ));
        }

        if self.registry.cancel_timer(&scope.id) {
            debug!("Restarting timer for scope {}", scope.id);
        }

        let period = scope.tick_interval();
        let weak = Arc::downgrade(self);
        let id = scope.id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if let Some(monitor) = weak.upgrade() {
                monitor.spawn_analysis_refresh(&id);
            }
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                // Own task: aborting this timer must not cut a cycle short.
                let cycle = tokio::spawn({
                    let monitor = Arc::clone(&monitor);
                    let id = id.clone();
                    async move { monitor.tick(&id).await }
                });
                if let Err(e) = cycle.await {
                    warn!("Cycle task for scope {} failed: {}", id, e);
                }
                monitor.spawn_analysis_refresh(&id);
            }
        });
        self.registry.replace_timer(&scope.id, handle);

        info!(
            "Monitoring scope {} every {}s",
            scope.id,
            period.as_secs()
        );
        Ok(())
    }

    /// Cancel future ticks. A cycle already running finishes, as do the
    /// optimizations it started. Returns whether a timer was running.
    pub fn stop_monitoring(&self, scope_id: &str) -> bool {
        let stopped = self.registry.cancel_timer(scope_id);
        if stopped {
            info!("Stopped monitoring scope {}", scope_id);
        }
        stopped
    }

    #[must_use]
    pub fn is_monitoring_active(&self, scope_id: &str) -> bool {
        self.registry.has_timer(scope_id)
    }

    async fn tick(&self, scope_id: &str) {
        match self.run_check_cycle(scope_id).await {
            Ok(report) => debug!("{}", report.summary()),
            Err(e) if e.skips_cycle() => warn!("Skipping cycle for scope {}: {}", scope_id, e),
            Err(e) => warn!("Cycle for scope {} failed: {}", scope_id, e),
        }
    }

    // ------------------------------------------------------------------------
    // Analyses
    // ------------------------------------------------------------------------

    /// Fetch the analysis of every session in the scope into the cache the
    /// cycle reads. Returns how many sessions have one.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids and
    /// [`OverseerError::Registry`] if sessions cannot be listed.
    pub async fn refresh_analyses(&self, scope_id: &str) -> Result<usize> {
        let scope = self.scope(scope_id)?;
        if self.analysis.is_none() {
            return Ok(0);
        }
        let candidates = self.detector.candidates(&scope)?;
        let fetched = join_all(candidates.iter().map(|session| async move {
            (session.id.clone(), self.analyze(session).await)
        }))
        .await;

        let mut cache = lock(&self.registry.analyses);
        let mut available = 0;
        for (id, analysis) in fetched {
            match analysis {
                Some(analysis) => {
                    cache.insert(id, analysis);
                    available += 1;
                }
                None => {
                    cache.remove(&id);
                }
            }
        }
        Ok(available)
    }

    fn spawn_analysis_refresh(self: &Arc<Self>, scope_id: &str) {
        if self.analysis.is_none() {
            return;
        }
        let monitor = Arc::clone(self);
        let scope_id = scope_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = monitor.refresh_analyses(&scope_id).await {
                warn!("Failed to refresh analyses for scope {}: {}", scope_id, e);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    /// Check a scope and react to stalled and erroring sessions.
    ///
    /// Paused scopes are skipped. The scope is `analyzing` while checking,
    /// `acting` while reacting and `idle` afterwards, unless it was paused
    /// meanwhile. Analyses come from the cache filled by
    /// [`refresh_analyses`](Self::refresh_analyses).
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::ScopeNotFound`] for unknown ids and
    /// [`OverseerError::Registry`] if sessions cannot be listed.
    pub async fn run_check_cycle(&self, scope_id: &str) -> Result<CycleReport> {
        let scope = self.set_status_if(
            scope_id,
            &[ScopeStatus::Idle, ScopeStatus::Analyzing, ScopeStatus::Acting],
            ScopeStatus::Analyzing,
        )?;
        if scope.is_paused() {
            debug!("Scope {} is paused", scope_id);
            let mut report = CycleReport::new(scope_id);
            report.skipped = true;
            return Ok(report);
        }

        let result = self.cycle(&scope).await;
        self.finish_cycle(&scope.id);
        result
    }

    async fn cycle(&self, scope: &MonitoredScope) -> Result<CycleReport> {
        let candidates = self.detector.candidates(scope)?;
        let members: HashSet<String> = candidates.iter().map(|s| s.id.clone()).collect();
        let departed = self.registry.update_scope_members(&scope.id, members);
        if !departed.is_empty() {
            debug!("Scope {}: {} session(s) departed", scope.id, departed.len());
        }
        let mut analyses = self
            .registry
            .cached_analyses(candidates.iter().map(|s| s.id.as_str()));

        let check = self
            .detector
            .classify_sessions(scope, candidates.clone())
            .await;
        let mut report = CycleReport::new(&scope.id);

        let tracker = self.store.tracker();
        for stalled in &check.stalled_sessions {
            tracker.record(&stalled.session.id, PerformanceEvent::Stall, None);
        }

        let mut to_react: Vec<(SessionInfo, bool)> = Vec::new();
        for session in candidates {
            let stalled = check.is_stalled(&session.id);
            let new_errors = analyses
                .get(&session.id)
                .map_or(0, |analysis| self.record_new_errors(&session.id, analysis));
            if new_errors > 0 {
                report.errored_sessions.push(session.id.clone());
            }
            if stalled || new_errors > 0 {
                to_react.push((session, stalled));
            }
        }

        if !to_react.is_empty() {
            self.set_status_if(&scope.id, &[ScopeStatus::Analyzing], ScopeStatus::Acting)?;
        }
        for (session, stalled) in to_react {
            let analysis = analyses.remove(&session.id);
            self.react(scope, &session, stalled, analysis, &mut report);
        }

        report.check = Some(check);
        if !report.rolled_back.is_empty() || !report.triggered.is_empty() {
            info!("{}", report.summary());
        }
        Ok(report)
    }

    fn react(
        &self,
        scope: &MonitoredScope,
        session: &SessionInfo,
        stalled: bool,
        analysis: Option<SessionAnalysis>,
        report: &mut CycleReport,
    ) {
        if self
            .rollback
            .check_and_auto_rollback(&session.id, &scope.owner_id)
        {
            report.rolled_back.push(session.id.clone());
            return;
        }

        let degraded_without_fallback =
            self.store.tracker().is_degraded(&session.id) && self.store.stack_len(&session.id) == 1;

        let record = if degraded_without_fallback {
            self.coordinator
                .trigger_for_poor_performance(session, Some(&scope.id), analysis)
        } else {
            match analysis {
                Some(analysis) if analysis.has_error_pattern() => self
                    .coordinator
                    .trigger_for_error_pattern(session, Some(&scope.id), analysis),
                analysis if stalled => {
                    self.coordinator
                        .trigger_for_stall(session, Some(&scope.id), analysis)
                }
                _ => None,
            }
        };

        if let Some(record) = record {
            report.triggered.push(record);
        }
    }

    /// Turn errors the analysis reported since the last cycle into error
    /// events. Returns how many were new.
    fn record_new_errors(&self, session_id: &str, analysis: &SessionAnalysis) -> usize {
        let total = analysis.errors_encountered.len();
        let previous = lock(&self.registry.seen_errors)
            .insert(session_id.to_string(), total)
            .unwrap_or(0);
        let new_errors = total.saturating_sub(previous);

        let tracker = self.store.tracker();
        for _ in 0..new_errors {
            tracker.record(session_id, PerformanceEvent::Error, None);
        }
        if new_errors > 0 {
            debug!("Session {}: {} new error(s)", session_id, new_errors);
        }
        new_errors
    }

    /// Return the scope to idle unless it was paused or deleted meanwhile.
    fn finish_cycle(&self, scope_id: &str) {
        let result = self.scopes.set_status_if(
            scope_id,
            &[ScopeStatus::Analyzing, ScopeStatus::Acting],
            ScopeStatus::Idle,
        );
        if let Err(e) = result {
            warn!("Failed to reset status of scope {}: {}", scope_id, e);
        }
    }
}
