//! Stall detection over a monitored scope.
//!
//! [`StallDetector::check`] lists the sessions a scope observes and asks a
//! [`StallStrategy`] about each of them. The default
//! [`TimestampStrategy`] only reads activity timestamps and is cheap enough
//! to run on every tick. Full terminal capture happens in
//! [`StallDetector::diagnose`], on request, for sessions already found
//! stalled.

pub mod strategy;

pub use strategy::{classify_timestamp, ContentDiffStrategy, StallStrategy, TimestampStrategy};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{IntoOverseerError, OverseerError, Result};
use crate::registry::MonitoringRegistry;
use crate::scope::{MonitoredScope, ScopeKind};
use crate::session::{DiagnosticCapture, SessionInfo, SessionRegistry};

/// Why a session was classified as stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StallReason {
    /// The session never reported activity.
    NoActivity,
    /// No activity for `idle_seconds`.
    Inactive { idle_seconds: i64 },
    /// Terminal text unchanged for `unchanged_seconds`.
    ContentUnchanged { unchanged_seconds: i64 },
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActivity => write!(f, "no activity recorded"),
            Self::Inactive { idle_seconds } => write!(f, "idle for {}s", idle_seconds),
            Self::ContentUnchanged { unchanged_seconds } => {
                write!(f, "terminal unchanged for {}s", unchanged_seconds)
            }
        }
    }
}

/// A session found stalled by one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalledSession {
    pub session: SessionInfo,
    pub reason: StallReason,
}

/// Outcome of checking one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallCheckResult {
    pub scope_id: String,
    pub stalled_sessions: Vec<StalledSession>,
    /// Number of sessions the scope observed.
    pub checked_sessions: usize,
    pub checked_at: DateTime<Utc>,
}

impl StallCheckResult {
    fn empty(scope_id: &str, checked_at: DateTime<Utc>) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            stalled_sessions: Vec::new(),
            checked_sessions: 0,
            checked_at,
        }
    }

    #[must_use]
    pub fn is_stalled(&self, session_id: &str) -> bool {
        self.stalled_sessions
            .iter()
            .any(|s| s.session.id == session_id)
    }
}

/// Full terminal capture of a stalled session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub session_id: String,
    pub reason: StallReason,
    pub captured_at: DateTime<Utc>,
    /// `None` when no capture is configured or the terminal is gone.
    pub text: Option<String>,
}

/// Runs stall checks for scopes.
pub struct StallDetector {
    registry: Arc<MonitoringRegistry>,
    sessions: Arc<dyn SessionRegistry>,
    strategy: Arc<dyn StallStrategy>,
    capture: Option<Arc<dyn DiagnosticCapture>>,
}

impl StallDetector {
    /// Detector using the timestamp strategy.
    #[must_use]
    pub fn new(registry: Arc<MonitoringRegistry>, sessions: Arc<dyn SessionRegistry>) -> Self {
        let strategy = Arc::new(TimestampStrategy::new(Arc::clone(&sessions)));
        Self {
            registry,
            sessions,
            strategy,
            capture: None,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn StallStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable [`diagnose`](Self::diagnose).
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn DiagnosticCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Active sessions the scope observes.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::Registry`] if sessions cannot be listed.
    pub fn candidates(&self, scope: &MonitoredScope) -> Result<Vec<SessionInfo>> {
        if scope.kind == ScopeKind::Folder && scope.scope_ref.is_none() {
            return Ok(Vec::new());
        }
        let sessions = self
            .sessions
            .list_active_sessions(&scope.owner_id)
            .into_registry_error()?;
        Ok(sessions.into_iter().filter(|s| scope.observes(s)).collect())
    }

    /// Classify every session the scope observes.
    ///
    /// A session whose own lookup fails is skipped with a warning; only a
    /// failure to list the scope's sessions fails the check.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::Registry`] if sessions cannot be listed.
    pub async fn check(&self, scope: &MonitoredScope) -> Result<StallCheckResult> {
        let now = self.registry.now();
        if scope.kind == ScopeKind::Folder && scope.scope_ref.is_none() {
            debug!("Folder scope {} has no folder reference, nothing to check", scope.id);
            return Ok(StallCheckResult::empty(&scope.id, now));
        }

        let candidates = self.candidates(scope)?;
        Ok(self.classify_sessions(scope, candidates).await)
    }

    /// Classify already listed sessions against the scope's threshold.
    pub async fn classify_sessions(
        &self,
        scope: &MonitoredScope,
        candidates: Vec<SessionInfo>,
    ) -> StallCheckResult {
        let now = self.registry.now();
        let threshold = to_chrono(scope.stall_threshold());
        let mut result = StallCheckResult::empty(&scope.id, now);
        result.checked_sessions = candidates.len();

        for session in candidates {
            match self.strategy.classify(&session, threshold, now).await {
                Ok(Some(reason)) => {
                    debug!("Session {} stalled: {}", session.label(), reason);
                    result.stalled_sessions.push(StalledSession { session, reason });
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Skipping session {} in scope {}: {:#}",
                    session.label(),
                    scope.id,
                    e
                ),
            }
        }

        if !result.stalled_sessions.is_empty() {
            info!(
                "Scope {}: {}/{} session(s) stalled ({})",
                scope.id,
                result.stalled_sessions.len(),
                result.checked_sessions,
                self.strategy.name()
            );
        }
        result
    }

    /// Capture the full terminal text of a stalled session.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture tool fails.
    pub async fn diagnose(&self, stalled: &StalledSession) -> Result<Diagnosis> {
        let text = match (&self.capture, stalled.session.terminal_ref.as_deref()) {
            (Some(capture), Some(terminal_ref)) => capture
                .capture_text(terminal_ref)
                .await
                .map_err(OverseerError::Other)?,
            _ => None,
        };
        Ok(Diagnosis {
            session_id: stalled.session.id.clone(),
            reason: stalled.reason,
            captured_at: self.registry.now(),
            text,
        })
    }

    /// Timestamp classification of one session against `threshold`,
    /// independent of the configured strategy.
    ///
    /// # Errors
    ///
    /// Returns [`OverseerError::Registry`] if the session cannot be looked up.
    pub fn classify_now(
        &self,
        session: &SessionInfo,
        threshold: std::time::Duration,
    ) -> Result<Option<StallReason>> {
        let last_activity = self
            .sessions
            .last_activity(&session.id)
            .into_registry_error()?;
        Ok(classify_timestamp(
            last_activity,
            to_chrono(threshold),
            self.registry.now(),
        ))
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
}
