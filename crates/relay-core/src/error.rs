use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome classes a failed provider attempt is sorted into.
///
/// The class alone decides what the orchestrator does next: rotate to another
/// credential, retry the same one, shrink history, or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimit,
    /// `recoverable = false` covers revoked or invalid grants that no retry can fix.
    Auth { recoverable: bool },
    Billing,
    Timeout,
    ContextOverflow,
    ToolChainCorruption,
    Unknown,
}

impl FailureClass {
    /// Classes that rotate to the next credential profile and set a cooldown.
    pub fn triggers_rotation(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Auth { recoverable: true })
    }

    /// Classes that end the run immediately with a user-visible error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Billing | Self::Auth { recoverable: false } | Self::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth { recoverable: true } => "auth",
            Self::Auth { recoverable: false } => "auth_permanent",
            Self::Billing => "billing",
            Self::Timeout => "timeout",
            Self::ContextOverflow => "context_overflow",
            Self::ToolChainCorruption => "tool_chain_corruption",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the Relay workspace.
#[derive(Error, Debug)]
pub enum RelayError {
    // ── Provider errors ────────────────────────────────────────
    /// A raw upstream failure. `status` and `code` are carried when the
    /// provider reported them so classification can prefer them over text.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("llm rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("llm context window exceeded: used {used} of {max} tokens")]
    ContextOverflow { used: usize, max: usize },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider not registered: {0}")]
    ProviderNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    // ── Run orchestration errors ───────────────────────────────
    #[error("session tool-call chain corrupted; retry required: {0}")]
    ToolChainCorrupted(String),

    /// A failure that has already been classified and is surfacing to the caller.
    #[error("{class} failure from {provider}/{model}: {message}")]
    Classified {
        class: FailureClass,
        provider: String,
        model: String,
        message: String,
    },

    #[error("no usable auth profile for provider {provider}")]
    ProfilesExhausted { provider: String },

    #[error("All models failed ({attempts}): {summary}")]
    AllCandidatesFailed { attempts: usize, summary: String },

    // ── Stores ─────────────────────────────────────────────────
    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("auth profile store error: {0}")]
    ProfileStore(String),

    #[error("secret resolution failed: {0}")]
    Secret(String),

    // ── Gateway / subagent errors ──────────────────────────────
    #[error("gateway call failed: {method}: {reason}")]
    Gateway { method: String, reason: String },

    #[error("subagent run not found: {0}")]
    SubagentNotFound(String),

    #[error("subagent limit reached: {0}")]
    SubagentLimit(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Shorthand for an upstream failure with no structured status or code.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// The class attached to an already-classified error, if any.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Self::Classified { class, .. } => Some(*class),
            Self::ToolChainCorrupted(_) => Some(FailureClass::ToolChainCorruption),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
