//! Agent providers and their instruction-file names.
//!
//! Each provider reads its standing instructions from a well-known file in the
//! session directory. The mapping is a closed lookup table so adding a
//! provider is a one-line edit to [`PROVIDER_FILES`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instruction file used when a provider has no dedicated entry.
pub const DEFAULT_CONFIG_FILE: &str = "AGENT.md";

/// Agent providers known to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProvider {
    Claude,
    Codex,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
    /// Any other agent CLI; uses [`DEFAULT_CONFIG_FILE`].
    Generic,
}

/// Provider -> instruction file name.
pub const PROVIDER_FILES: &[(AgentProvider, &str)] = &[
    (AgentProvider::Claude, "CLAUDE.md"),
    (AgentProvider::Codex, "AGENTS.md"),
    (AgentProvider::Gemini, "GEMINI.md"),
    (AgentProvider::OpenCode, "OPENCODE.md"),
];

impl AgentProvider {
    /// Instruction file name for this provider.
    ///
    /// # Example
    ///
    /// ```
    /// use overseer::provider::AgentProvider;
    ///
    /// assert_eq!(AgentProvider::Claude.config_filename(), "CLAUDE.md");
    /// assert_eq!(AgentProvider::Generic.config_filename(), "AGENT.md");
    /// ```
    #[must_use]
    pub fn config_filename(&self) -> &'static str {
        PROVIDER_FILES
            .iter()
            .find(|(provider, _)| provider == self)
            .map(|(_, file)| *file)
            .unwrap_or(DEFAULT_CONFIG_FILE)
    }

    /// Wire name of the provider.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::OpenCode => "opencode",
            Self::Generic => "generic",
        }
    }

    /// Parse a provider string as reported by the terminal backend.
    ///
    /// Returns `None` for the explicit "none" marker and for empty strings;
    /// unknown names map to [`AgentProvider::Generic`].
    ///
    /// # Example
    ///
    /// ```
    /// use overseer::provider::AgentProvider;
    ///
    /// assert_eq!(AgentProvider::parse("codex"), Some(AgentProvider::Codex));
    /// assert_eq!(AgentProvider::parse("none"), None);
    /// assert_eq!(AgentProvider::parse("aider"), Some(AgentProvider::Generic));
    /// ```
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => None,
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            "opencode" => Some(Self::OpenCode),
            _ => Some(Self::Generic),
        }
    }
}

impl fmt::Display for AgentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
