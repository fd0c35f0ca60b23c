//! Deciding when to optimize, and running optimizations in the background.
//!
//! Every trigger goes through the same gate: a per-session cooldown shared by
//! all trigger reasons, then a check that the session runs an agent at all.
//! The cooldown is taken when the attempt is scheduled, not when it ends, so
//! two ticks can never start overlapping attempts for one session.
//!
//! The attempt itself runs as a detached Tokio task. It owns everything it
//! needs and reports back only by updating its record in the registry; its
//! failures never reach the caller that scheduled it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    OptimizationJournal, OptimizationRecord, OptimizationRequest, OptimizationResponse,
    OptimizationStatus, OptimizationTask, OptimizationTrigger, OptimizerClient, OptimizerOptions,
    ProjectContext,
};
use crate::analysis::SessionAnalysis;
use crate::error::{OverseerError, Result};
use crate::provider::AgentProvider;
use crate::registry::{lock, MonitoringRegistry};
use crate::session::SessionInfo;
use crate::versions::ConfigVersionStore;

/// Minimum optimizer score for a proposed configuration to be applied.
pub const APPLY_SCORE_THRESHOLD: f64 = 0.7;

/// Error recorded on cancelled attempts.
pub const CANCELLED_REASON: &str = "cancelled";

/// Recent errors passed to the optimizer as constraints.
const MAX_ERROR_CONSTRAINTS: usize = 5;

/// Schedules and tracks optimization attempts.
#[derive(Clone)]
pub struct OptimizationCoordinator {
    registry: Arc<MonitoringRegistry>,
    store: Arc<ConfigVersionStore>,
    optimizer: Arc<dyn OptimizerClient>,
    options: OptimizerOptions,
    journal: Option<OptimizationJournal>,
}

impl OptimizationCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<MonitoringRegistry>,
        store: Arc<ConfigVersionStore>,
        optimizer: Arc<dyn OptimizerClient>,
    ) -> Self {
        Self {
            registry,
            store,
            optimizer,
            options: OptimizerOptions::default(),
            journal: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: OptimizerOptions) -> Self {
        self.options = options;
        self
    }

    /// Log finished attempts and restore earlier ones into the history.
    #[must_use]
    pub fn with_journal(mut self, journal: OptimizationJournal) -> Self {
        match journal.read_records() {
            Ok(previous) => {
                let mut records = lock(&self.registry.optimizations);
                for record in previous {
                    if !records.iter().any(|r| r.id == record.id) {
                        records.push(record);
                    }
                }
            }
            Err(e) => warn!("Failed to read optimization journal: {}", e),
        }
        self.journal = Some(journal);
        self
    }

    // ------------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------------

    /// Request an optimization because the session stalled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger_for_stall(
        &self,
        session: &SessionInfo,
        scope_ref: Option<&str>,
        analysis: Option<SessionAnalysis>,
    ) -> Option<OptimizationRecord> {
        self.trigger(
            session,
            scope_ref,
            OptimizationTrigger::StallDetected,
            analysis,
            false,
        )
    }

    /// Request an optimization because errors keep piling up unfixed.
    ///
    /// Declined unless at least
    /// [`ERROR_PATTERN_THRESHOLD`](crate::analysis::ERROR_PATTERN_THRESHOLD)
    /// errors are unfixed.
    pub fn trigger_for_error_pattern(
        &self,
        session: &SessionInfo,
        scope_ref: Option<&str>,
        analysis: SessionAnalysis,
    ) -> Option<OptimizationRecord> {
        self.trigger(
            session,
            scope_ref,
            OptimizationTrigger::ErrorPattern,
            Some(analysis),
            false,
        )
    }

    /// Request an optimization because the only version is degraded and
    /// there is nothing to roll back to.
    pub fn trigger_for_poor_performance(
        &self,
        session: &SessionInfo,
        scope_ref: Option<&str>,
        analysis: Option<SessionAnalysis>,
    ) -> Option<OptimizationRecord> {
        self.trigger(
            session,
            scope_ref,
            OptimizationTrigger::PoorPerformance,
            analysis,
            false,
        )
    }

    /// Operator request. Ignores the cooldown but still starts it.
    pub fn trigger_manual(
        &self,
        session: &SessionInfo,
        analysis: Option<SessionAnalysis>,
    ) -> Option<OptimizationRecord> {
        self.trigger(session, None, OptimizationTrigger::Manual, analysis, true)
    }

    fn trigger(
        &self,
        session: &SessionInfo,
        scope_ref: Option<&str>,
        trigger: OptimizationTrigger,
        analysis: Option<SessionAnalysis>,
        bypass_cooldown: bool,
    ) -> Option<OptimizationRecord> {
        let now = self.registry.now();
        let cooldowns = self.registry.optimization_cooldowns();

        if !bypass_cooldown && cooldowns.is_cooling_down(&session.id, now) {
            debug!(
                "Optimization for session {} is cooling down, skipping {} trigger",
                session.label(),
                trigger
            );
            return None;
        }

        let Some(provider) = session.agent_provider else {
            debug!(
                "Session {} runs no agent, skipping {} trigger",
                session.label(),
                trigger
            );
            return None;
        };

        if trigger == OptimizationTrigger::ErrorPattern
            && !analysis.as_ref().is_some_and(SessionAnalysis::has_error_pattern)
        {
            debug!(
                "Session {} has too few unfixed errors for an error-pattern trigger",
                session.label()
            );
            return None;
        }

        if bypass_cooldown {
            cooldowns.mark(&session.id, now);
        } else if !cooldowns.try_acquire(&session.id, now) {
            return None;
        }

        let mut record =
            OptimizationRecord::new(&session.id, scope_ref.map(str::to_string), trigger, now);
        record.initial_score = self.store.active(&session.id).and_then(|s| s.score);
        lock(&self.registry.optimizations).push(record.clone());

        info!(
            "Scheduling {} optimization {} for session {}",
            trigger,
            record.id,
            session.label()
        );

        let run = self.clone();
        let record_id = record.id.clone();
        let session = session.clone();
        let handle = tokio::spawn(async move {
            run.run(record_id, session, provider, trigger, analysis).await;
        });

        let mut tasks = lock(&self.registry.optimization_tasks);
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(record.id.clone(), handle);

        Some(record)
    }

    // ------------------------------------------------------------------------
    // Background run
    // ------------------------------------------------------------------------

    async fn run(
        &self,
        record_id: String,
        session: SessionInfo,
        provider: AgentProvider,
        trigger: OptimizationTrigger,
        analysis: Option<SessionAnalysis>,
    ) {
        let started = self.update(&record_id, |r, now| {
            if let Err(e) = r.transition(OptimizationStatus::Running, now) {
                debug!("Not starting optimization: {}", e);
            }
        });
        if !started.is_some_and(|r| r.status == OptimizationStatus::Running) {
            return;
        }

        let request = build_request(&record_id, &session, trigger, analysis.as_ref(), self.options);

        match self.execute(&record_id, &session.id, provider, &request).await {
            Ok((response, applied, write_error)) => {
                let finished = self.update(&record_id, |r, now| {
                    r.iterations = response.iterations;
                    r.final_score = Some(response.final_score);
                    r.config_applied = applied;
                    r.suggestions_applied = if applied {
                        response.suggestions_applied
                    } else {
                        0
                    };
                    r.error = write_error.clone();
                    if let Err(e) = r.transition(OptimizationStatus::Completed, now) {
                        debug!("Optimization finished after it ended: {}", e);
                    }
                });
                if let Some(record) = finished {
                    info!("Optimization {}", record.summary());
                    self.journal(&record);
                }
            }
            Err(e) => {
                warn!("Optimization {} failed: {}", record_id, e);
                let failed = self.update(&record_id, |r, now| {
                    if let Err(inner) = r.fail(e.to_string(), now) {
                        debug!("Optimization failed after it ended: {}", inner);
                    }
                });
                if let Some(record) = failed {
                    self.journal(&record);
                }
            }
        }

        self.end_apply(&record_id);
        lock(&self.registry.optimization_tasks).remove(&record_id);
    }

    /// Call the optimizer and apply its configuration when it clears the
    /// quality bar. Returns the response, whether the write succeeded, and
    /// the write error if it did not.
    ///
    /// Once the apply phase begins the attempt can no longer be cancelled;
    /// [`run`](Self::run) ends the phase after recording the outcome.
    async fn execute(
        &self,
        record_id: &str,
        session_id: &str,
        provider: AgentProvider,
        request: &OptimizationRequest,
    ) -> Result<(OptimizationResponse, bool, Option<String>)> {
        let timeout = Duration::from_secs(self.options.timeout_seconds);
        let response = match tokio::time::timeout(timeout, self.optimizer.optimize(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(OverseerError::optimizer(format!("{e:#}"))),
            Err(_) => {
                return Err(OverseerError::optimizer(format!(
                    "optimizer timed out after {}s",
                    self.options.timeout_seconds
                )))
            }
        };

        debug!(
            "Optimizer answered for {} after {} iteration(s), score {:.2}",
            record_id, response.iterations, response.final_score
        );

        if response.final_score < APPLY_SCORE_THRESHOLD {
            info!(
                "Score {:.2} below {:.2}, not applying configuration for session {}",
                response.final_score, APPLY_SCORE_THRESHOLD, session_id
            );
            return Ok((response, false, None));
        }
        let Some(config) = response.config.clone() else {
            debug!("Optimizer returned no configuration for session {}", session_id);
            return Ok((response, false, None));
        };
        if !self.begin_apply(record_id) {
            debug!("Optimization {} ended while the optimizer ran", record_id);
            return Ok((response, false, None));
        }

        let snapshot = self
            .store
            .snapshot(session_id, &config.id, provider, Some(response.final_score))?
            .ok_or_else(|| {
                OverseerError::config_read(session_id, "session has no configuration location")
            })?;

        match self
            .store
            .write(session_id, provider, &config.instructions_file)
        {
            Ok(()) => {
                info!(
                    "Applied configuration {} to session {} after snapshot v{}",
                    config.id, session_id, snapshot.version
                );
                Ok((response, true, None))
            }
            Err(e) => {
                warn!("Failed to apply configuration to session {}: {}", session_id, e);
                Ok((response, false, Some(e.to_string())))
            }
        }
    }

    /// Apply `f` to a non-terminal record. Returns the record afterwards,
    /// `None` if it is missing or already terminal.
    fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut OptimizationRecord, chrono::DateTime<chrono::Utc>),
    ) -> Option<OptimizationRecord> {
        let now = self.registry.now();
        let mut records = lock(&self.registry.optimizations);
        let record = records.iter_mut().find(|r| r.id == id)?;
        if record.is_terminal() {
            return None;
        }
        f(record, now);
        Some(record.clone())
    }

    /// Enter the apply phase unless the attempt already ended. Checked under
    /// the records lock, so a concurrent cancel either lands first or is
    /// refused.
    fn begin_apply(&self, id: &str) -> bool {
        let records = lock(&self.registry.optimizations);
        let live = records
            .iter()
            .find(|r| r.id == id)
            .is_some_and(|r| !r.is_terminal());
        if live {
            lock(&self.registry.applying).insert(id.to_string());
        }
        live
    }

    fn end_apply(&self, id: &str) {
        lock(&self.registry.applying).remove(id);
    }

    fn journal(&self, record: &OptimizationRecord) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(record) {
                warn!("Failed to journal optimization {}: {}", record.id, e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries and control
    // ------------------------------------------------------------------------

    /// Cancel a pending or running attempt.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::OptimizationNotFound`] for unknown ids,
    /// [`OverseerError::InvalidTransition`] for attempts that already ended
    /// and [`OverseerError::OptimizationApplying`] while the configuration
    /// is being written.
    pub fn cancel(&self, id: &str) -> Result<OptimizationRecord> {
        let now = self.registry.now();
        let record = {
            let mut records = lock(&self.registry.optimizations);
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| OverseerError::OptimizationNotFound { id: id.to_string() })?;
            if !record.is_terminal() && lock(&self.registry.applying).contains(id) {
                return Err(OverseerError::OptimizationApplying { id: id.to_string() });
            }
            record.fail(CANCELLED_REASON, now)?;
            record.clone()
        };

        if let Some(handle) = lock(&self.registry.optimization_tasks).remove(id) {
            handle.abort();
        }
        info!("Cancelled optimization {} for session {}", id, record.session_id);
        self.journal(&record);
        Ok(record)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<OptimizationRecord> {
        lock(&self.registry.optimizations)
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Attempts newest first, optionally filtered by session and scope.
    #[must_use]
    pub fn history(
        &self,
        session_id: Option<&str>,
        scope_id: Option<&str>,
        limit: usize,
    ) -> Vec<OptimizationRecord> {
        let mut records: Vec<OptimizationRecord> = lock(&self.registry.optimizations)
            .iter()
            .filter(|r| session_id.is_none_or(|s| r.session_id == s))
            .filter(|r| scope_id.is_none_or(|s| r.scope_ref.as_deref() == Some(s)))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        records
    }

    /// Wait until every scheduled attempt has finished.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = lock(&self.registry.optimization_tasks)
                .drain()
                .map(|(_, h)| h)
                .collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!("Optimization task panicked: {}", e);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Request building
// ============================================================================

fn build_request(
    record_id: &str,
    session: &SessionInfo,
    trigger: OptimizationTrigger,
    analysis: Option<&SessionAnalysis>,
    options: OptimizerOptions,
) -> OptimizationRequest {
    let (task_type, reason, baseline) = match trigger {
        OptimizationTrigger::StallDetected => (
            "stall_recovery",
            "the agent stopped making progress",
            "The agent keeps working without going idle",
        ),
        OptimizationTrigger::ErrorPattern => (
            "error_recovery",
            "errors keep occurring without being fixed",
            "Errors are fixed before new work starts",
        ),
        OptimizationTrigger::PoorPerformance => (
            "performance_recovery",
            "the current configuration performs poorly",
            "Fewer stalls and errors than the current configuration",
        ),
        OptimizationTrigger::Manual => (
            "manual_optimization",
            "an operator requested it",
            "The agent follows project conventions",
        ),
    };

    let mut acceptance_criteria = vec![baseline.to_string()];
    let mut constraints = Vec::new();
    let mut relevant_files = Vec::new();
    let mut context = ProjectContext {
        project_path: session
            .working_dir
            .as_ref()
            .map(|dir| dir.display().to_string()),
        ..ProjectContext::default()
    };

    if let Some(analysis) = analysis {
        acceptance_criteria.extend(
            analysis
                .detected_patterns
                .iter()
                .map(|pattern| format!("No longer exhibits: {}", pattern)),
        );
        constraints.extend(
            analysis
                .recent_errors(MAX_ERROR_CONSTRAINTS)
                .iter()
                .map(|error| format!("Must not reproduce: {}", error)),
        );
        relevant_files = analysis.files_touched.clone();
        context = ProjectContext {
            project_path: analysis.project_path.clone().or(context.project_path),
            language: analysis.language.clone(),
            frameworks: analysis.frameworks.clone(),
            package_manager: analysis.package_manager.clone(),
            has_ci: analysis.has_ci,
        };
    }

    OptimizationRequest {
        task: OptimizationTask {
            id: record_id.to_string(),
            task_type: task_type.to_string(),
            description: format!(
                "Improve the agent instructions for session {} because {}",
                session.label(),
                reason
            ),
            acceptance_criteria,
            constraints,
            relevant_files,
        },
        context,
        options,
    }
}
