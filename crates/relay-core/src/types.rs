use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent run.
pub type RunId = String;

/// Key of a persisted session (e.g. `agent:main:telegram:12345`).
pub type SessionKey = String;

/// Identifier of an upstream provider (e.g. `anthropic`, `openai`).
pub type ProviderId = String;

/// Identifier of a credential profile (e.g. `anthropic:work`).
pub type ProfileId = String;

/// A `provider/model` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: ProviderId,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider/model`. The model part may itself contain slashes
    /// (`openrouter/meta-llama/llama-3`); only the first one splits.
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.trim().split_once('/')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider.to_lowercase(), model))
    }

    /// Stable key used for de-duplication.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Lifecycle of a run. Leaves `Running` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Ok,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    /// Parse the status strings returned by `agent.wait`.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "accepted" | "queued" => Some(Self::Pending),
            "running" | "in_flight" => Some(Self::Running),
            "ok" | "done" | "completed" => Some(Self::Ok),
            "error" | "failed" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical agent turn. Mutated only by the orchestrator that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub session_key: SessionKey,
    /// Provider and model of the latest attempt.
    pub provider: ProviderId,
    pub model: String,
    pub attempt_count: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(session_key: impl Into<String>, target: &ModelRef) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_key: session_key.into(),
            provider: target.provider.clone(),
            model: target.model.clone(),
            attempt_count: 0,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to a terminal status. Later calls are ignored.
    pub fn finish(&mut self, status: RunStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}
