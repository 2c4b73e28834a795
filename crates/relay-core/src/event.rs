use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::FailureClass;
use crate::types::RunStatus;

/// Run lifecycle events, published for observers (logs, dashboards, tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    // ── Run lifecycle ──────────────────────────────────────────
    RunStarted {
        run_id: String,
        session_key: String,
        provider: String,
        model: String,
    },
    AttemptFailed {
        run_id: String,
        attempt: u32,
        profile_id: String,
        provider: String,
        model: String,
        class: FailureClass,
    },
    ProfileRotated {
        run_id: String,
        from_profile: String,
        provider: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        attempts: u32,
    },

    // ── Subagent lifecycle ─────────────────────────────────────
    SubagentSpawned {
        run_id: String,
        parent_session_key: String,
        child_session_key: String,
    },
    SubagentAnnounced {
        run_id: String,
        parent_session_key: String,
        status: RunStatus,
    },

    // ── Admission ──────────────────────────────────────────────
    PermitAutoReleased {
        provider: String,
        held_since: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for run lifecycle pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RunEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
