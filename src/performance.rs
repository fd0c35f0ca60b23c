//! Per-session performance tracking for the active configuration version.
//!
//! The tracker keeps exactly one live [`PerformanceRecord`] per session,
//! describing the version currently on top of the session's version stack.
//! Whenever another version becomes active the live record is archived and
//! replaced by a zeroed one, so counters never leak across versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::registry::{lock, MonitoringRegistry};

/// Stalls on one version before it is considered degraded.
pub const DEGRADATION_STALL_THRESHOLD: u32 = 3;

/// Errors on one version before it is considered degraded.
pub const DEGRADATION_ERROR_THRESHOLD: u32 = 5;

/// Kind of event attributed to the active version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceEvent {
    Stall,
    Error,
    Success,
}

impl fmt::Display for PerformanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stall => write!(f, "stall"),
            Self::Error => write!(f, "error"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// Counters for one (session, version) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub session_id: String,
    pub config_version_id: String,
    pub stall_count: u32,
    pub error_count: u32,
    pub success_count: u32,
    pub avg_response_time_ms: Option<f64>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub degradation_detected: bool,
}

impl PerformanceRecord {
    /// Zeroed record for a freshly activated version.
    #[must_use]
    pub fn new(session_id: impl Into<String>, config_version_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            config_version_id: config_version_id.into(),
            stall_count: 0,
            error_count: 0,
            success_count: 0,
            avg_response_time_ms: None,
            last_activity_at: None,
            degradation_detected: false,
        }
    }

    /// Apply one event at `at`. Returns true when this event flipped the
    /// degradation flag.
    pub fn apply(
        &mut self,
        event: PerformanceEvent,
        response_time_ms: Option<f64>,
        at: DateTime<Utc>,
    ) -> bool {
        match event {
            PerformanceEvent::Stall => self.stall_count += 1,
            PerformanceEvent::Error => self.error_count += 1,
            PerformanceEvent::Success => self.success_count += 1,
        }

        if let Some(sample) = response_time_ms {
            self.avg_response_time_ms = Some(match self.avg_response_time_ms {
                Some(avg) => (avg + sample) / 2.0,
                None => sample,
            });
        }
        self.last_activity_at = Some(at);

        let was_degraded = self.degradation_detected;
        if self.stall_count >= DEGRADATION_STALL_THRESHOLD
            || self.error_count >= DEGRADATION_ERROR_THRESHOLD
        {
            self.degradation_detected = true;
        }
        !was_degraded && self.degradation_detected
    }

    /// Total number of recorded events.
    #[must_use]
    pub fn total_events(&self) -> u32 {
        self.stall_count + self.error_count + self.success_count
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "stalls={} errors={} successes={}{}",
            self.stall_count,
            self.error_count,
            self.success_count,
            if self.degradation_detected {
                " [degraded]"
            } else {
                ""
            }
        )
    }
}

/// Records events against the active version of each session.
#[derive(Clone)]
pub struct PerformanceTracker {
    registry: Arc<MonitoringRegistry>,
}

impl PerformanceTracker {
    #[must_use]
    pub fn new(registry: Arc<MonitoringRegistry>) -> Self {
        Self { registry }
    }

    /// Attribute an event to the session's active version.
    ///
    /// Does nothing when the session has no active version. Returns the
    /// updated record otherwise.
    pub fn record(
        &self,
        session_id: &str,
        event: PerformanceEvent,
        response_time_ms: Option<f64>,
    ) -> Option<PerformanceRecord> {
        let now = self.registry.now();
        let mut records = lock(&self.registry.performance);
        let Some(record) = records.get_mut(session_id) else {
            debug!(
                "No active version for session {}, ignoring {} event",
                session_id, event
            );
            return None;
        };

        if record.apply(event, response_time_ms, now) {
            info!(
                "Degradation detected for session {} on version {} ({})",
                session_id,
                record.config_version_id,
                record.summary()
            );
        }
        Some(record.clone())
    }

    /// Start a zeroed record for `version_id`, archiving the previous one.
    pub fn reset(&self, session_id: &str, version_id: &str) {
        let fresh = PerformanceRecord::new(session_id, version_id);
        let previous = lock(&self.registry.performance).insert(session_id.to_string(), fresh);

        if let Some(previous) = previous {
            debug!(
                "Archiving counters for session {} version {}: {}",
                session_id,
                previous.config_version_id,
                previous.summary()
            );
            lock(&self.registry.performance_archive)
                .entry(session_id.to_string())
                .or_default()
                .push(previous);
        }
    }

    /// Drop the live record (session has no active version any more).
    pub fn clear(&self, session_id: &str) {
        lock(&self.registry.performance).remove(session_id);
    }

    /// Live record for the session's active version.
    #[must_use]
    pub fn current(&self, session_id: &str) -> Option<PerformanceRecord> {
        lock(&self.registry.performance).get(session_id).cloned()
    }

    /// Whether the active version has crossed a degradation threshold.
    #[must_use]
    pub fn is_degraded(&self, session_id: &str) -> bool {
        lock(&self.registry.performance)
            .get(session_id)
            .is_some_and(|r| r.degradation_detected)
    }

    /// Counters for a specific version: the live record when it is active,
    /// otherwise the most recent archived record for it.
    #[must_use]
    pub fn for_version(&self, session_id: &str, version_id: &str) -> Option<PerformanceRecord> {
        if let Some(live) = lock(&self.registry.performance)
            .get(session_id)
            .filter(|r| r.config_version_id == version_id)
        {
            return Some(live.clone());
        }

        lock(&self.registry.performance_archive)
            .get(session_id)
            .and_then(|archived| {
                archived
                    .iter()
                    .rev()
                    .find(|r| r.config_version_id == version_id)
                    .cloned()
            })
    }
}
