//! Automatic rollback of degraded configuration versions.
//!
//! A version is rolled back when it has accumulated enough stalls or errors
//! since it became active (see [`crate::performance`]) and there is an older
//! version to return to. Automatic rollbacks of one session are at least
//! [`ROLLBACK_COOLDOWN_SECS`](crate::registry::ROLLBACK_COOLDOWN_SECS) apart.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ConfigVersionStore, RollbackOutcome};
use crate::registry::MonitoringRegistry;

/// Reason recorded on versions rolled back by the monitor.
pub const AUTO_ROLLBACK_REASON: &str =
    "automatic rollback: performance degraded after version became active";

/// Decides when a session's active version should be reverted.
pub struct RollbackController {
    registry: Arc<MonitoringRegistry>,
    store: Arc<ConfigVersionStore>,
}

impl RollbackController {
    #[must_use]
    pub fn new(registry: Arc<MonitoringRegistry>, store: Arc<ConfigVersionStore>) -> Self {
        Self { registry, store }
    }

    /// True when there is a version to return to and the active one is
    /// degraded.
    #[must_use]
    pub fn should_rollback(&self, session_id: &str) -> bool {
        self.store.stack_len(session_id) >= 2 && self.store.tracker().is_degraded(session_id)
    }

    /// Roll back a degraded version unless the session is cooling down.
    ///
    /// The cooldown timestamp is recorded only when the rollback succeeds.
    /// Returns whether a rollback happened; callers skip optimization for the
    /// session in that case.
    pub fn check_and_auto_rollback(&self, session_id: &str, actor_id: &str) -> bool {
        let now = self.registry.now();
        let cooldowns = self.registry.rollback_cooldowns();
        if cooldowns.is_cooling_down(session_id, now) {
            debug!("Rollback for session {} is cooling down", session_id);
            return false;
        }

        let tracker = self.store.tracker();
        let result = self
            .store
            .rollback_if(session_id, AUTO_ROLLBACK_REASON, |stack_len| {
                stack_len >= 2
                    && tracker.is_degraded(session_id)
                    && !cooldowns.is_cooling_down(session_id, now)
            });

        match result {
            Ok(Some(version)) => {
                cooldowns.mark(session_id, now);
                info!(
                    "Automatic rollback of session {} to v{} (requested by {})",
                    session_id, version, actor_id
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Automatic rollback of session {} failed: {}", session_id, e);
                false
            }
        }
    }

    /// Operator-requested rollback. Bypasses the degradation check but
    /// starts the cooldown on success so the automatic path does not undo
    /// another version right away.
    pub fn rollback_now(&self, session_id: &str, reason: &str) -> RollbackOutcome {
        let outcome = self.store.rollback(session_id, reason);
        if outcome.success {
            self.registry
                .rollback_cooldowns()
                .mark(session_id, self.registry.now());
        }
        outcome
    }
}
