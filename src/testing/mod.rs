//! Testing infrastructure for Overseer.
//!
//! Test doubles for every external collaborator of the monitor, so the
//! detection loop, rollback and optimization paths can be exercised without a
//! terminal backend, an optimizer or a real clock.
//!
//! # Example
//!
//! ```rust
//! use overseer::provider::AgentProvider;
//! use overseer::session::SessionInfo;
//! use overseer::testing::{MockClock, MockOptimizer, MockSessionRegistry};
//!
//! let clock = MockClock::new();
//! let sessions = MockSessionRegistry::new().with_session(
//!     SessionInfo::new("s-1", "user")
//!         .with_provider(AgentProvider::Claude)
//!         .with_last_activity(clock.now_utc()),
//! );
//! let optimizer = MockOptimizer::new().with_score(0.9).with_config("cfg-2", "be brief");
//! # let _ = (sessions, optimizer);
//! ```

pub mod mocks;

pub use mocks::*;
