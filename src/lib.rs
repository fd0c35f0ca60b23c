//! Overseer - watchdog for agent-driven terminal sessions
//!
//! Overseer watches long-running agent sessions for stalls and repeated
//! unfixed errors, asks an external optimizer for a better agent
//! configuration when they happen, and rolls a configuration back when it
//! performs worse than the one it replaced.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`monitor`] - Facade, per-scope timers and the check cycle
//! - [`detector`] - Stall detection strategies
//! - [`performance`] - Per-version event counters and degradation
//! - [`versions`] - Configuration snapshots, history and rollback
//! - [`optimizer`] - Cooldown-gated optimization runs
//! - [`registry`] - Shared monitoring state and cooldowns
//! - [`scope`] - Monitored scopes and their store
//! - [`session`] - Session registry and terminal capture collaborators
//! - [`storage`] - Agent instruction files
//! - [`config`] - Project settings
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks)
//!
//! # Example
//!
//! ```rust,ignore
//! use overseer::{Monitor, MonitorSettings, MonitoredScope};
//!
//! let settings = MonitorSettings::load_validated(project_dir)?;
//! let monitor = Monitor::open(project_dir, &settings);
//!
//! let scope = monitor.create_scope(MonitoredScope::master("user-1"))?;
//! monitor.start_monitoring(&scope.id)?;
//!
//! // Later: what happened to a session's configuration?
//! for row in monitor.get_performance_correlation("session-1") {
//!     println!("v{} score={:?} stalls={}", row.version, row.score, row.stall_count);
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod optimizer;
pub mod performance;
pub mod persist;
pub mod provider;
pub mod registry;
pub mod scope;
pub mod session;
pub mod storage;
pub mod testing;
pub mod versions;

// Re-export commonly used types
pub use error::{IntoOverseerError, OverseerError, Result};

pub use config::{DetectionStrategy, MonitorSettings, OptimizerSettings};
pub use detector::{StallCheckResult, StallDetector, StallReason, StalledSession};
pub use monitor::{CycleReport, Monitor, MonitorBuilder, VersionPerformance};
pub use optimizer::{
    OptimizationCoordinator, OptimizationRecord, OptimizationStatus, OptimizationTrigger,
    OptimizerClient,
};
pub use performance::{PerformanceEvent, PerformanceRecord, PerformanceTracker};
pub use provider::AgentProvider;
pub use registry::{Clock, MonitoringRegistry, SystemClock};
pub use scope::{MonitoredScope, ScopeKind, ScopeStatus, ScopeStore};
pub use session::{DiagnosticCapture, SessionInfo, SessionRegistry};
pub use storage::ConfigStorage;
pub use versions::{ConfigVersionSnapshot, ConfigVersionStore, RollbackController, RollbackOutcome};
