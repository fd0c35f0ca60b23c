//! Mock implementations of the monitor's collaborators.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::analysis::{AnalysisSource, SessionAnalysis};
use crate::optimizer::{OptimizationRequest, OptimizationResponse, OptimizedConfig, OptimizerClient};
use crate::provider::AgentProvider;
use crate::registry::{lock, Clock};
use crate::session::{DiagnosticCapture, SessionInfo, SessionRegistry};
use crate::storage::ConfigStorage;

// ============================================================================
// Clock
// ============================================================================

/// Manually driven clock.
///
/// # Example
///
/// ```rust
/// use chrono::Duration;
/// use overseer::testing::MockClock;
///
/// let clock = MockClock::new();
/// let start = clock.now_utc();
/// clock.advance(Duration::minutes(5));
/// assert_eq!(clock.now_utc() - start, Duration::minutes(5));
/// ```
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Clock starting at 2026-01-01T00:00:00Z.
    #[must_use]
    pub fn new() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Current mock time (same as [`Clock::now`], usable without the trait).
    #[must_use]
    pub fn now_utc(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now_utc()
    }
}

// ============================================================================
// Session registry
// ============================================================================

/// In-memory session table.
#[derive(Debug, Default)]
pub struct MockSessionRegistry {
    sessions: Mutex<Vec<(SessionInfo, bool)>>,
    failing: AtomicBool,
}

impl MockSessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(self, session: SessionInfo) -> Self {
        self.add_session(session);
        self
    }

    /// Known to the backend but no longer active.
    #[must_use]
    pub fn with_inactive_session(self, session: SessionInfo) -> Self {
        lock(&self.sessions).push((session, false));
        self
    }

    /// Every query fails.
    #[must_use]
    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Add or replace an active session.
    pub fn add_session(&self, session: SessionInfo) {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|(s, _)| s.id != session.id);
        sessions.push((session, true));
    }

    pub fn remove_session(&self, session_id: &str) {
        lock(&self.sessions).retain(|(s, _)| s.id != session_id);
    }

    pub fn set_last_activity(&self, session_id: &str, at: DateTime<Utc>) {
        if let Some((session, _)) = lock(&self.sessions)
            .iter_mut()
            .find(|(s, _)| s.id == session_id)
        {
            session.last_activity_at = Some(at);
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("session registry unavailable");
        }
        Ok(())
    }
}

impl SessionRegistry for MockSessionRegistry {
    fn last_activity(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.check()?;
        lock(&self.sessions)
            .iter()
            .find(|(s, _)| s.id == session_id)
            .map(|(s, _)| s.last_activity_at)
            .ok_or_else(|| anyhow::anyhow!("Unknown session: {}", session_id))
    }

    fn list_active_sessions(&self, owner_id: &str) -> Result<Vec<SessionInfo>> {
        self.check()?;
        Ok(lock(&self.sessions)
            .iter()
            .filter(|(s, active)| *active && s.owner_id == owner_id)
            .map(|(s, _)| s.clone())
            .collect())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        self.check()?;
        Ok(lock(&self.sessions)
            .iter()
            .find(|(s, _)| s.id == session_id)
            .map(|(s, _)| s.clone()))
    }
}

// ============================================================================
// Config storage
// ============================================================================

/// Configuration content per session, ignoring the provider filename.
#[derive(Debug, Default)]
pub struct MockConfigStorage {
    locations: Mutex<HashSet<String>>,
    configs: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, AgentProvider, String)>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockConfigStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session with a storage location and existing content.
    #[must_use]
    pub fn with_config(self, session_id: &str, content: &str) -> Self {
        self.set_config(session_id, content);
        self
    }

    /// Session with a storage location but no file yet.
    #[must_use]
    pub fn with_location(self, session_id: &str) -> Self {
        lock(&self.locations).insert(session_id.to_string());
        self
    }

    #[must_use]
    pub fn failing_reads(self) -> Self {
        self.fail_reads.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace content as if the session edited its own file.
    pub fn set_config(&self, session_id: &str, content: &str) {
        lock(&self.locations).insert(session_id.to_string());
        lock(&self.configs).insert(session_id.to_string(), content.to_string());
    }

    #[must_use]
    pub fn config(&self, session_id: &str) -> Option<String> {
        lock(&self.configs).get(session_id).cloned()
    }

    /// Successful writes in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, AgentProvider, String)> {
        lock(&self.writes).clone()
    }
}

impl ConfigStorage for MockConfigStorage {
    fn read_config(&self, session_id: &str, _provider: AgentProvider) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("read failed for {}", session_id);
        }
        if !lock(&self.locations).contains(session_id) {
            return Ok(None);
        }
        Ok(Some(self.config(session_id).unwrap_or_default()))
    }

    fn write_config(
        &self,
        session_id: &str,
        provider: AgentProvider,
        content: &str,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("write failed for {}", session_id);
        }
        if !lock(&self.locations).contains(session_id) {
            anyhow::bail!("no storage location for {}", session_id);
        }
        lock(&self.configs).insert(session_id.to_string(), content.to_string());
        lock(&self.writes).push((session_id.to_string(), provider, content.to_string()));
        Ok(())
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Optimizer with a canned answer.
#[derive(Debug)]
pub struct MockOptimizer {
    iterations: u32,
    score: f64,
    config: Option<OptimizedConfig>,
    error: Option<String>,
    delay: Option<std::time::Duration>,
    calls: AtomicU32,
    requests: Mutex<Vec<OptimizationRequest>>,
}

impl Default for MockOptimizer {
    fn default() -> Self {
        Self {
            iterations: 1,
            score: 0.8,
            config: None,
            error: None,
            delay: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockOptimizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Return a configuration whose instruction file is `content`.
    #[must_use]
    pub fn with_config(mut self, id: &str, content: &str) -> Self {
        self.config = Some(OptimizedConfig {
            id: id.to_string(),
            provider: None,
            instructions_file: content.to_string(),
            system_prompt: None,
        });
        self
    }

    #[must_use]
    pub fn failing(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<OptimizationRequest> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn last_request(&self) -> Option<OptimizationRequest> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl OptimizerClient for MockOptimizer {
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.error {
            anyhow::bail!("{}", error);
        }

        Ok(OptimizationResponse {
            iterations: self.iterations,
            final_score: self.score,
            config: self.config.clone(),
            suggestions_applied: u32::from(self.config.is_some()),
        })
    }
}

// ============================================================================
// Diagnostic capture
// ============================================================================

/// Terminal text per terminal reference.
#[derive(Debug, Default)]
pub struct MockCapture {
    texts: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    calls: AtomicU32,
}

impl MockCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_text(self, terminal_ref: &str, text: &str) -> Self {
        self.set_text(terminal_ref, text);
        self
    }

    #[must_use]
    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_text(&self, terminal_ref: &str, text: &str) {
        lock(&self.texts).insert(terminal_ref.to_string(), text.to_string());
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticCapture for MockCapture {
    async fn capture_text(&self, terminal_ref: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("capture failed for {}", terminal_ref);
        }
        Ok(lock(&self.texts).get(terminal_ref).cloned())
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Analysis payload per session id.
#[derive(Debug, Default)]
pub struct MockAnalysisSource {
    analyses: Mutex<HashMap<String, SessionAnalysis>>,
}

impl MockAnalysisSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_analysis(self, session_id: &str, analysis: SessionAnalysis) -> Self {
        self.set_analysis(session_id, analysis);
        self
    }

    pub fn set_analysis(&self, session_id: &str, analysis: SessionAnalysis) {
        lock(&self.analyses).insert(session_id.to_string(), analysis);
    }
}

#[async_trait]
impl AnalysisSource for MockAnalysisSource {
    async fn analyze(&self, session: &SessionInfo) -> Result<Option<SessionAnalysis>> {
        Ok(lock(&self.analyses).get(&session.id).cloned())
    }
}
