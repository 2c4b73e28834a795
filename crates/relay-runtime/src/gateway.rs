//! Gateway RPC surface used by subagent spawning and announcement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_core::{RelayError, Result, RunStatus};

/// Parameters of the `agent` RPC: start a run in a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    pub session_key: String,
    pub message: String,
    /// Deliver the final reply to the session's channel.
    pub deliver: bool,
    /// Block until the run produces its final reply.
    pub expect_final: bool,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAccepted {
    pub run_id: String,
}

/// Parameters of the `send` RPC: deliver a message straight to a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendParams {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub message: String,
    pub idempotency_key: String,
}

/// Result of one `agent.wait` probe. A non-terminal status means the probe
/// window ran out while the run was still going.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitResult {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WaitResult {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn still_running() -> Self {
        Self::status(RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn agent(&self, params: AgentParams) -> Result<AgentAccepted>;

    async fn send(&self, params: SendParams) -> Result<()>;

    async fn agent_wait(&self, run_id: &str, timeout_ms: u64) -> Result<WaitResult>;

    async fn chat_history(&self, session_key: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn sessions_patch(&self, session_key: &str, label: Option<&str>) -> Result<()>;

    async fn sessions_delete(&self, session_key: &str, delete_transcript: bool) -> Result<()>;
}

// ── Recording gateway ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Agent(AgentParams),
    Send(SendParams),
    Wait { run_id: String, timeout_ms: u64 },
    History { session_key: String, limit: usize },
    Patch { session_key: String, label: Option<String> },
    Delete { session_key: String, delete_transcript: bool },
}

/// In-process gateway that records every call and answers from scripted state.
/// Used by tests and by embedders that have no gateway connection.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    waits: Mutex<HashMap<String, VecDeque<WaitResult>>>,
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
    failing: Mutex<HashMap<&'static str, String>>,
    next_run: AtomicU64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `agent.wait` answers for a run. The last one repeats.
    pub fn script_wait(&self, run_id: &str, results: impl IntoIterator<Item = WaitResult>) {
        self.waits
            .lock()
            .entry(run_id.to_string())
            .or_default()
            .extend(results);
    }

    pub fn set_history(&self, session_key: &str, messages: Vec<ChatMessage>) {
        self.histories.lock().insert(session_key.to_string(), messages);
    }

    /// Make every call to `method` fail with `reason`.
    pub fn fail_method(&self, method: &'static str, reason: &str) {
        self.failing.lock().insert(method, reason.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn agent_calls(&self) -> Vec<AgentParams> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Agent(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn send_calls(&self) -> Vec<SendParams> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Send(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn wait_timeouts(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Wait { timeout_ms, .. } => Some(*timeout_ms),
                _ => None,
            })
            .collect()
    }

    fn record(&self, method: &'static str, call: GatewayCall) -> Result<()> {
        self.calls.lock().push(call);
        match self.failing.lock().get(method) {
            Some(reason) => Err(RelayError::Gateway {
                method: method.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GatewayClient for RecordingGateway {
    async fn agent(&self, params: AgentParams) -> Result<AgentAccepted> {
        self.record("agent", GatewayCall::Agent(params))?;
        let n = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AgentAccepted {
            run_id: format!("run-{n}"),
        })
    }

    async fn send(&self, params: SendParams) -> Result<()> {
        self.record("send", GatewayCall::Send(params))
    }

    async fn agent_wait(&self, run_id: &str, timeout_ms: u64) -> Result<WaitResult> {
        self.record(
            "agent.wait",
            GatewayCall::Wait {
                run_id: run_id.to_string(),
                timeout_ms,
            },
        )?;
        let result = {
            let mut waits = self.waits.lock();
            let next = waits.get_mut(run_id).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            next.unwrap_or_else(|| WaitResult::status(RunStatus::Ok))
        };
        // A live gateway holds the call open until the run ends or the probe expires.
        if !result.status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        }
        Ok(result)
    }

    async fn chat_history(&self, session_key: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        self.record(
            "chat.history",
            GatewayCall::History {
                session_key: session_key.to_string(),
                limit,
            },
        )?;
        let histories = self.histories.lock();
        let messages = histories.get(session_key).cloned().unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn sessions_patch(&self, session_key: &str, label: Option<&str>) -> Result<()> {
        self.record(
            "sessions.patch",
            GatewayCall::Patch {
                session_key: session_key.to_string(),
                label: label.map(str::to_string),
            },
        )
    }

    async fn sessions_delete(&self, session_key: &str, delete_transcript: bool) -> Result<()> {
        self.record(
            "sessions.delete",
            GatewayCall::Delete {
                session_key: session_key.to_string(),
                delete_transcript,
            },
        )
    }
}
