//! Reporting a finished child run back to the session that spawned it.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relay_core::{EventBus, RelayError, Result, RunEvent, RunStatus};

use crate::gateway::{AgentParams, GatewayClient, SendParams};
use crate::session_store::SessionStore;
use crate::subagent::{SubagentCleanup, SubagentRegistry, SubagentRunRecord};

/// A child reply of exactly this text suppresses the announcement.
pub const ANNOUNCE_SKIP: &str = "ANNOUNCE_SKIP";

/// Messages read from the child transcript when looking for its final reply.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Delivered; `direct` when the result went straight to the requester's channel.
    Delivered { direct: bool },
    /// The child asked for no announcement.
    Skipped,
    /// Another caller already announced (or is announcing) this run.
    AlreadyAnnounced,
    /// The wait window closed with the child still running; the claim was released.
    Pending,
}

/// Idempotency key for the announcement of one child run.
pub fn announce_idempotency_key(record: &SubagentRunRecord) -> String {
    format!("announce:v1:{}:{}", record.child_session_key, record.run_id)
}

pub fn format_duration_short(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

pub fn format_tokens_short(n: u64) -> String {
    match n {
        0..1_000 => n.to_string(),
        1_000..1_000_000 => format!("{:.1}k", n as f64 / 1_000.0),
        _ => format!("{:.1}m", n as f64 / 1_000_000.0),
    }
}

/// Build the text the requester sees.
pub fn build_announce_message(record: &SubagentRunRecord, reply: Option<&str>, stats: Option<&str>) -> String {
    let name = record.display_name();
    let headline = match record.last_status {
        RunStatus::Ok => format!("✅ Subagent \"{name}\" finished."),
        RunStatus::Timeout => format!("⏱️ Subagent \"{name}\" timed out."),
        _ => match &record.error {
            Some(e) => format!("❌ Subagent \"{name}\" failed: {e}"),
            None => format!("❌ Subagent \"{name}\" failed."),
        },
    };

    let mut message = headline;
    message.push_str("\n\n");
    match reply.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reply) => message.push_str(reply),
        None => message.push_str("(no output)"),
    }
    if let Some(stats) = stats {
        message.push_str("\n\n");
        message.push_str(stats);
    }
    message
}

/// Delivers child results to requesters, exactly once per run.
pub struct AnnounceFlow {
    gateway: Arc<dyn GatewayClient>,
    registry: Arc<SubagentRegistry>,
    sessions: Option<Arc<dyn SessionStore>>,
    events: Option<EventBus>,
}

impl AnnounceFlow {
    pub fn new(gateway: Arc<dyn GatewayClient>, registry: Arc<SubagentRegistry>) -> Self {
        Self {
            gateway,
            registry,
            sessions: None,
            events: None,
        }
    }

    /// Session store the stats line is read from.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Wait for the child and announce it in the background.
    pub fn watch(self: &Arc<Self>, run_id: &str) -> JoinHandle<Result<AnnounceOutcome>> {
        let flow = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let outcome = flow.announce(&run_id).await;
            if let Err(e) = &outcome {
                warn!(run_id = %run_id, error = %e, "subagent announce failed");
            }
            outcome
        })
    }

    pub async fn announce(&self, run_id: &str) -> Result<AnnounceOutcome> {
        if self.registry.get(run_id).is_none() {
            if self.registry.was_announced(run_id) {
                return Ok(AnnounceOutcome::AlreadyAnnounced);
            }
            return Err(RelayError::SubagentNotFound(run_id.to_string()));
        }
        if !self.registry.claim_announce(run_id) {
            return Ok(AnnounceOutcome::AlreadyAnnounced);
        }

        match self.deliver(run_id).await {
            Ok(AnnounceOutcome::Pending) => {
                self.registry.release_announce_claim(run_id);
                Ok(AnnounceOutcome::Pending)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.registry.release_announce_claim(run_id);
                Err(e)
            }
        }
    }

    async fn deliver(&self, run_id: &str) -> Result<AnnounceOutcome> {
        let record = self.registry.wait(run_id, self.gateway.as_ref()).await?;
        if record.is_active() {
            info!(run_id, "subagent still running after wait window; announce deferred");
            return Ok(AnnounceOutcome::Pending);
        }

        let reply = match &record.reply {
            Some(reply) => Some(reply.clone()),
            None => self.read_latest_reply(&record.child_session_key).await,
        };

        if reply.as_deref().map(str::trim) == Some(ANNOUNCE_SKIP) {
            info!(run_id, "subagent asked to skip its announcement");
            self.registry.mark_announced(run_id);
            self.finish(&record).await;
            return Ok(AnnounceOutcome::Skipped);
        }

        let stats = self.stats_line(&record).await;
        let message = build_announce_message(&record, reply.as_deref(), Some(&stats));
        let key = announce_idempotency_key(&record);
        let origin = record.requester_origin.clone();

        let direct = match origin.filter(|_| record.expects_completion_message) {
            Some(origin) => {
                self.gateway
                    .send(SendParams {
                        channel: origin.channel,
                        to: origin.to,
                        account_id: origin.account_id,
                        thread_id: origin.thread_id,
                        message: message.clone(),
                        idempotency_key: key.clone(),
                    })
                    .await?;
                self.gateway
                    .agent(AgentParams {
                        session_key: record.requester_session_key.clone(),
                        message: format!(
                            "{message}\n\nThis result was already delivered to the user. \
                             Update your context; do not repeat it."
                        ),
                        deliver: false,
                        expect_final: false,
                        idempotency_key: format!("{key}-agent"),
                        ..Default::default()
                    })
                    .await?;
                true
            }
            None => {
                let origin = record.requester_origin.clone().unwrap_or_default();
                self.gateway
                    .agent(AgentParams {
                        session_key: record.requester_session_key.clone(),
                        message,
                        deliver: true,
                        expect_final: true,
                        idempotency_key: key,
                        channel: Some(origin.channel).filter(|c| !c.is_empty()),
                        to: Some(origin.to).filter(|t| !t.is_empty()),
                        account_id: origin.account_id,
                        thread_id: origin.thread_id,
                        ..Default::default()
                    })
                    .await?;
                false
            }
        };

        self.registry.mark_announced(run_id);
        info!(
            run_id,
            parent = %record.requester_session_key,
            status = %record.last_status,
            direct,
            "subagent result announced"
        );
        if let Some(events) = &self.events {
            events.publish(RunEvent::SubagentAnnounced {
                run_id: run_id.to_string(),
                parent_session_key: record.requester_session_key.clone(),
                status: record.last_status,
            });
        }
        self.finish(&record).await;
        Ok(AnnounceOutcome::Delivered { direct })
    }

    /// Latest non-empty assistant message in the child transcript.
    async fn read_latest_reply(&self, child_session_key: &str) -> Option<String> {
        match self.gateway.chat_history(child_session_key, HISTORY_LIMIT).await {
            Ok(messages) => messages
                .into_iter()
                .rev()
                .find(|m| m.role == "assistant" && !m.text.trim().is_empty())
                .map(|m| m.text),
            Err(e) => {
                warn!(session_key = child_session_key, error = %e, "could not read subagent transcript");
                None
            }
        }
    }

    async fn stats_line(&self, record: &SubagentRunRecord) -> String {
        let mut parts = Vec::new();
        if let Some(runtime) = record.runtime() {
            parts.push(format!("runtime {}", format_duration_short(runtime.num_seconds())));
        }
        if let Some(sessions) = &self.sessions
            && let Ok(Some(entry)) = sessions.get(&record.child_session_key).await
        {
            let input = entry.input_tokens.unwrap_or(0);
            let output = entry.output_tokens.unwrap_or(0);
            if input + output > 0 {
                parts.push(format!(
                    "tokens {} (in {} / out {})",
                    format_tokens_short(input + output),
                    format_tokens_short(input),
                    format_tokens_short(output)
                ));
            }
        }
        parts.push(format!("session {}", record.child_session_key));
        format!("Stats: {}", parts.join(" • "))
    }

    /// Best-effort child session cleanup, then drop the record.
    async fn finish(&self, record: &SubagentRunRecord) {
        if let Some(label) = &record.label
            && let Err(e) = self
                .gateway
                .sessions_patch(&record.child_session_key, Some(label))
                .await
        {
            warn!(session_key = %record.child_session_key, error = %e, "failed to label subagent session");
        }
        if record.cleanup == SubagentCleanup::Delete
            && let Err(e) = self
                .gateway
                .sessions_delete(&record.child_session_key, true)
                .await
        {
            warn!(session_key = %record.child_session_key, error = %e, "failed to delete subagent session");
        }
        self.registry.remove(&record.run_id);
    }
}
