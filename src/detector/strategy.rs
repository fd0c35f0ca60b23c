//! Stall classification strategies.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::StallReason;
use crate::registry::lock;
use crate::session::{DiagnosticCapture, SessionInfo, SessionRegistry};

/// Decides whether one session is stalled.
#[async_trait]
pub trait StallStrategy: Send + Sync {
    /// Short name for logs and CLI output.
    fn name(&self) -> &'static str;

    /// `Some(reason)` when the session counts as stalled at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying collaborator cannot be queried.
    async fn classify(
        &self,
        session: &SessionInfo,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<StallReason>>;
}

/// Classify from the last activity timestamp alone.
///
/// Stalled when the session never produced activity, or when the last
/// activity is at least `threshold` old.
#[must_use]
pub fn classify_timestamp(
    last_activity: Option<DateTime<Utc>>,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Option<StallReason> {
    match last_activity {
        None => Some(StallReason::NoActivity),
        Some(at) => {
            let idle = now - at;
            (idle >= threshold).then_some(StallReason::Inactive {
                idle_seconds: idle.num_seconds(),
            })
        }
    }
}

// ============================================================================
// Timestamp
// ============================================================================

/// Cheap default: compares the registry's last-activity timestamp with the
/// threshold.
pub struct TimestampStrategy {
    sessions: Arc<dyn SessionRegistry>,
}

impl TimestampStrategy {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl StallStrategy for TimestampStrategy {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    async fn classify(
        &self,
        session: &SessionInfo,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<StallReason>> {
        let last_activity = self.sessions.last_activity(&session.id)?;
        Ok(classify_timestamp(last_activity, threshold, now))
    }
}

// ============================================================================
// Content diff
// ============================================================================

#[derive(Debug, Clone)]
struct Fingerprint {
    hash: String,
    changed_at: DateTime<Utc>,
}

/// Captures the terminal text on every check and reports a stall when its
/// hash has not changed for the threshold.
///
/// Expensive: each check runs a full capture. Sessions without a terminal
/// reference, or whose terminal is gone, are never reported.
pub struct ContentDiffStrategy {
    capture: Arc<dyn DiagnosticCapture>,
    fingerprints: Mutex<HashMap<String, Fingerprint>>,
}

impl ContentDiffStrategy {
    #[must_use]
    pub fn new(capture: Arc<dyn DiagnosticCapture>) -> Self {
        Self {
            capture,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    /// Hex SHA-256 of the captured text.
    #[must_use]
    pub fn fingerprint(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// Forget a session's fingerprint.
    pub fn forget(&self, session_id: &str) {
        lock(&self.fingerprints).remove(session_id);
    }
}

#[async_trait]
impl StallStrategy for ContentDiffStrategy {
    fn name(&self) -> &'static str {
        "content-diff"
    }

    async fn classify(
        &self,
        session: &SessionInfo,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<StallReason>> {
        let Some(terminal_ref) = session.terminal_ref.as_deref() else {
            debug!("Session {} has no terminal, cannot diff", session.label());
            return Ok(None);
        };

        let Some(text) = self.capture.capture_text(terminal_ref).await? else {
            warn!(
                "Terminal {} of session {} is gone",
                terminal_ref,
                session.label()
            );
            self.forget(&session.id);
            return Ok(None);
        };

        let hash = Self::fingerprint(&text);
        let mut fingerprints = lock(&self.fingerprints);
        match fingerprints.get(&session.id) {
            Some(previous) if previous.hash == hash => {
                let unchanged = now - previous.changed_at;
                Ok((unchanged >= threshold).then_some(StallReason::ContentUnchanged {
                    unchanged_seconds: unchanged.num_seconds(),
                }))
            }
            _ => {
                fingerprints.insert(
                    session.id.clone(),
                    Fingerprint {
                        hash,
                        changed_at: now,
                    },
                );
                Ok(None)
            }
        }
    }
}
