//! Registry of child (subagent) runs and how they are spawned and awaited.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_config::SubagentConfig;
use relay_core::{EventBus, RelayError, Result, RunEvent, RunStatus};

use crate::gateway::{AgentParams, GatewayClient, WaitResult};

/// Hard cap on a single `agent.wait` probe.
pub const MAX_PROBE: Duration = Duration::from_millis(2000);

/// Slack on top of a probe's own timeout before the caller gives up on it.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// Pause after a failed probe so a broken gateway is not hammered.
const PROBE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentCleanup {
    #[default]
    Keep,
    /// Delete the child session once its result is announced.
    Delete,
}

/// Where the requester's conversation lives, for direct delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryContext {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentRunRecord {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<DeliveryContext>,
    /// How the requester session is named in announce text.
    pub requester_display_key: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub cleanup: SubagentCleanup,
    /// Deliver the result straight to the requester's channel, then let the
    /// requester agent react without re-delivering.
    pub expects_completion_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final reply, when the run reported it in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub announce_claimed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl SubagentRunRecord {
    pub fn new(
        run_id: impl Into<String>,
        child_session_key: impl Into<String>,
        requester_session_key: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        let requester_session_key = requester_session_key.into();
        Self {
            run_id: run_id.into(),
            child_session_key: child_session_key.into(),
            requester_display_key: requester_session_key.clone(),
            requester_session_key,
            requester_origin: None,
            task: task.into(),
            label: None,
            cleanup: SubagentCleanup::Keep,
            expects_completion_message: false,
            run_timeout_secs: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_status: RunStatus::Pending,
            error: None,
            reply: None,
            announce_claimed: false,
            announced_at: None,
            last_checked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.last_status.is_terminal()
    }

    /// Label if set, else the task text.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.task)
    }

    pub fn runtime(&self) -> Option<ChronoDuration> {
        let start = self.started_at.unwrap_or(self.created_at);
        self.ended_at.map(|end| end - start)
    }
}

fn count_active(runs: &HashMap<String, SubagentRunRecord>, requester_session_key: &str) -> usize {
    runs.values()
        .filter(|r| r.requester_session_key == requester_session_key && r.is_active())
        .count()
}

fn release_slot(reserved: &mut HashMap<String, usize>, requester_session_key: &str) {
    if let Some(n) = reserved.get_mut(requester_session_key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            reserved.remove(requester_session_key);
        }
    }
}

/// A child slot held between the limit check and registration. Dropping it
/// unused gives the slot back.
pub struct SlotReservation<'a> {
    registry: &'a SubagentRegistry,
    requester_session_key: String,
    held: bool,
}

impl SlotReservation<'_> {
    /// Register the child in the reserved slot.
    pub fn register(mut self, record: SubagentRunRecord) {
        let mut runs = self.registry.runs.write();
        release_slot(&mut self.registry.reserved.lock(), &self.requester_session_key);
        self.held = false;
        debug!(run_id = %record.run_id, child = %record.child_session_key, "subagent run registered");
        runs.insert(record.run_id.clone(), record);
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            release_slot(&mut self.registry.reserved.lock(), &self.requester_session_key);
        }
    }
}

/// Partial update applied by [`SubagentRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct SubagentPatch {
    pub last_status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub reply: Option<String>,
    pub label: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl SubagentPatch {
    fn apply(self, record: &mut SubagentRunRecord) {
        if let Some(status) = self.last_status {
            // A terminal status is final.
            if !record.last_status.is_terminal() {
                record.last_status = status;
            }
        }
        if let Some(v) = self.started_at {
            record.started_at.get_or_insert(v);
        }
        if let Some(v) = self.ended_at {
            record.ended_at.get_or_insert(v);
        }
        if self.error.is_some() {
            record.error = self.error;
        }
        if self.reply.is_some() {
            record.reply = self.reply;
        }
        if self.label.is_some() {
            record.label = self.label;
        }
        if self.last_checked_at.is_some() {
            record.last_checked_at = self.last_checked_at;
        }
    }

    fn from_wait(result: &WaitResult, now: DateTime<Utc>) -> Self {
        let terminal = result.status.is_terminal();
        Self {
            last_status: Some(result.status),
            started_at: result.started_at,
            ended_at: if terminal {
                Some(result.ended_at.unwrap_or(now))
            } else {
                None
            },
            error: result.error.clone(),
            last_checked_at: Some(now),
            ..Default::default()
        }
    }
}

// ── Settings ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentSettings {
    pub wait_timeout: Duration,
    pub probe_timeout: Duration,
    pub archive_after: ChronoDuration,
    pub default_run_timeout_secs: Option<u64>,
    pub max_children_per_session: usize,
    pub agent_id: String,
}

impl SubagentSettings {
    pub fn from_config(config: &SubagentConfig) -> Self {
        Self {
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms.max(1)).min(MAX_PROBE),
            archive_after: ChronoDuration::minutes(config.archive_after_minutes as i64),
            default_run_timeout_secs: (config.run_timeout_secs > 0).then_some(config.run_timeout_secs),
            max_children_per_session: config.max_children_per_session,
            agent_id: config.agent_id.clone(),
        }
    }
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self::from_config(&SubagentConfig::default())
    }
}

// ── Registry ───────────────────────────────────────────────────

static SHARED: Lazy<Arc<SubagentRegistry>> = Lazy::new(|| Arc::new(SubagentRegistry::default()));

/// Process-wide registry of child runs.
///
/// A record is removed once its result is announced; the run id is kept as a
/// tombstone until the next [`sweep`](Self::sweep) past `archive_after`, so a
/// repeated announce is recognised. Terminal records that were never announced
/// are swept on the same schedule.
#[derive(Default)]
pub struct SubagentRegistry {
    runs: RwLock<HashMap<String, SubagentRunRecord>>,
    announced: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Child slots held by spawns that have not registered yet, per requester.
    reserved: Mutex<HashMap<String, usize>>,
    settings: RwLock<SubagentSettings>,
}

impl SubagentRegistry {
    pub fn new(settings: SubagentSettings) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            announced: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
            settings: RwLock::new(settings),
        }
    }

    /// The registry shared by everything in this process.
    pub fn shared() -> Arc<SubagentRegistry> {
        Arc::clone(&SHARED)
    }

    pub fn settings(&self) -> SubagentSettings {
        self.settings.read().clone()
    }

    pub fn apply_config(&self, config: &SubagentConfig) {
        *self.settings.write() = SubagentSettings::from_config(config);
    }

    pub fn register(&self, record: SubagentRunRecord) {
        debug!(run_id = %record.run_id, child = %record.child_session_key, "subagent run registered");
        self.runs.write().insert(record.run_id.clone(), record);
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn update(&self, run_id: &str, patch: SubagentPatch) -> Option<SubagentRunRecord> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(run_id)?;
        patch.apply(record);
        Some(record.clone())
    }

    /// Record an in-process completion.
    pub fn mark_ended(
        &self,
        run_id: &str,
        status: RunStatus,
        reply: Option<String>,
        error: Option<String>,
    ) -> Option<SubagentRunRecord> {
        self.update(
            run_id,
            SubagentPatch {
                last_status: Some(status),
                ended_at: Some(Utc::now()),
                reply,
                error,
                ..Default::default()
            },
        )
    }

    /// Children of a requester session, oldest first.
    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRunRecord> {
        let mut records: Vec<SubagentRunRecord> = self
            .runs
            .read()
            .values()
            .filter(|r| r.requester_session_key == requester_session_key)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn count_active_for_session(&self, requester_session_key: &str) -> usize {
        count_active(&self.runs.read(), requester_session_key)
    }

    /// Hold one child slot for a requester until the child is registered
    /// through the reservation or the reservation is dropped.
    pub fn reserve_slot(&self, requester_session_key: &str, max: usize) -> Result<SlotReservation<'_>> {
        let runs = self.runs.read();
        let mut reserved = self.reserved.lock();
        let pending = reserved.get(requester_session_key).copied().unwrap_or(0);
        let taken = count_active(&runs, requester_session_key) + pending;
        if taken >= max {
            return Err(RelayError::SubagentLimit(format!(
                "session {requester_session_key} already has {taken} active subagent(s) (max {max})"
            )));
        }
        *reserved.entry(requester_session_key.to_string()).or_insert(0) += 1;
        Ok(SlotReservation {
            registry: self,
            requester_session_key: requester_session_key.to_string(),
            held: true,
        })
    }

    /// Spawns holding a slot that have not registered yet.
    pub fn reserved_for_session(&self, requester_session_key: &str) -> usize {
        self.reserved
            .lock()
            .get(requester_session_key)
            .copied()
            .unwrap_or(0)
    }

    /// Take the announce claim. Exactly one caller gets `true` until the claim
    /// is released.
    pub fn claim_announce(&self, run_id: &str) -> bool {
        if self.was_announced(run_id) {
            return false;
        }
        let mut runs = self.runs.write();
        match runs.get_mut(run_id) {
            Some(record) if !record.announce_claimed => {
                record.announce_claimed = true;
                true
            }
            _ => false,
        }
    }

    /// Give the claim back after a failed delivery so a later attempt can retry.
    pub fn release_announce_claim(&self, run_id: &str) {
        if let Some(record) = self.runs.write().get_mut(run_id)
            && record.announced_at.is_none()
        {
            record.announce_claimed = false;
        }
    }

    /// Record a delivered announce. The run id is remembered past removal.
    pub fn mark_announced(&self, run_id: &str) {
        let now = Utc::now();
        if let Some(record) = self.runs.write().get_mut(run_id) {
            record.announce_claimed = true;
            record.announced_at = Some(now);
        }
        self.announced.write().insert(run_id.to_string(), now);
    }

    pub fn was_announced(&self, run_id: &str) -> bool {
        self.announced.read().contains_key(run_id)
    }

    pub fn remove(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.runs.write().remove(run_id)
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    /// Drop terminal records that ended more than `archive_after` before `now`,
    /// and announce tombstones of the same age.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let archive_after = self.settings.read().archive_after;
        self.announced
            .write()
            .retain(|_, at| now - *at < archive_after);
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, r| {
            let finished_at = r.announced_at.or(r.ended_at);
            match finished_at {
                Some(at) if !r.is_active() => now - at < archive_after,
                _ => true,
            }
        });
        let swept = before - runs.len();
        if swept > 0 {
            info!(swept, remaining = runs.len(), "swept archived subagent runs");
        }
        swept
    }

    /// Sweep on a fixed interval until the returned handle is aborted.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep(Utc::now());
            }
        })
    }

    /// Total time to wait for a child before announcing what is known.
    fn wait_window(&self, record: &SubagentRunRecord) -> Duration {
        let wait = self.settings.read().wait_timeout;
        match record.run_timeout_secs {
            // Stop just short of the child's own deadline.
            Some(secs) if secs > 0 => {
                let cap = Duration::from_secs(secs).saturating_sub(Duration::from_secs(1));
                wait.min(cap.max(Duration::from_millis(1)))
            }
            _ => wait,
        }
    }

    /// Poll `agent.wait` until the child reaches a terminal status or the wait
    /// window closes. Each probe asks for at most `min(remaining, probe cap)`.
    /// Returns the latest record, terminal or not.
    pub async fn wait(&self, run_id: &str, gateway: &dyn GatewayClient) -> Result<SubagentRunRecord> {
        let record = self
            .get(run_id)
            .ok_or_else(|| RelayError::SubagentNotFound(run_id.to_string()))?;
        if !record.is_active() {
            return Ok(record);
        }

        let probe_cap = self.settings.read().probe_timeout;
        let deadline = Instant::now() + self.wait_window(&record);
        let mut probes = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let probe = remaining.min(probe_cap);
            let probe_ms = (probe.as_millis() as u64).max(1);
            probes += 1;

            match tokio::time::timeout(probe + PROBE_GRACE, gateway.agent_wait(run_id, probe_ms)).await {
                Ok(Ok(result)) => {
                    let updated = self
                        .update(run_id, SubagentPatch::from_wait(&result, Utc::now()))
                        .ok_or_else(|| RelayError::SubagentNotFound(run_id.to_string()))?;
                    if !updated.is_active() {
                        info!(run_id, status = %updated.last_status, probes, "subagent run finished");
                        return Ok(updated);
                    }
                }
                Ok(Err(e)) => {
                    warn!(run_id, error = %e, "agent.wait probe failed");
                    tokio::time::sleep(PROBE_ERROR_BACKOFF.min(remaining)).await;
                }
                Err(_) => {
                    debug!(run_id, probe_ms, "agent.wait probe did not answer in time");
                }
            }
        }

        debug!(run_id, probes, "subagent wait window closed; run still active");
        self.get(run_id)
            .ok_or_else(|| RelayError::SubagentNotFound(run_id.to_string()))
    }
}

// ── Spawning ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SpawnParams {
    pub requester_session_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub requester_display_key: Option<String>,
    pub task: String,
    pub label: Option<String>,
    /// Agent whose session namespace the child lives in; defaults to the configured one.
    pub agent_id: Option<String>,
    pub cleanup: SubagentCleanup,
    pub expects_completion_message: bool,
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnResult {
    pub run_id: String,
    pub child_session_key: String,
}

pub fn child_session_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:subagent:{}", Uuid::new_v4())
}

fn child_system_prompt(params: &SpawnParams, display_key: &str) -> String {
    let label = params
        .label
        .as_deref()
        .map(|l| format!(" labelled \"{l}\""))
        .unwrap_or_default();
    format!(
        "You are a subagent{label} spawned by session {display_key}.\n\
         Complete the task on your own using your tools. Your final reply is \
         reported back to the requester automatically, so end with a clear summary \
         of what you did and found. Reply with ANNOUNCE_SKIP if there is nothing \
         worth reporting."
    )
}

/// Starts child runs through the gateway and registers them.
#[derive(Clone)]
pub struct SubagentSpawner {
    gateway: Arc<dyn GatewayClient>,
    registry: Arc<SubagentRegistry>,
    events: Option<EventBus>,
}

impl SubagentSpawner {
    pub fn new(gateway: Arc<dyn GatewayClient>, registry: Arc<SubagentRegistry>) -> Self {
        Self {
            gateway,
            registry,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn spawn(&self, params: SpawnParams) -> Result<SpawnResult> {
        let settings = self.registry.settings();
        let slot = self
            .registry
            .reserve_slot(&params.requester_session_key, settings.max_children_per_session)?;

        let agent_id = params.agent_id.clone().unwrap_or(settings.agent_id.clone());
        let child_key = child_session_key(&agent_id);
        let display_key = params
            .requester_display_key
            .clone()
            .unwrap_or_else(|| params.requester_session_key.clone());
        let run_timeout_secs = params.run_timeout_secs.or(settings.default_run_timeout_secs);

        let accepted = self
            .gateway
            .agent(AgentParams {
                session_key: child_key.clone(),
                message: params.task.clone(),
                deliver: false,
                expect_final: false,
                idempotency_key: Uuid::new_v4().to_string(),
                lane: Some("subagent".into()),
                label: params.label.clone(),
                extra_system_prompt: Some(child_system_prompt(&params, &display_key)),
                ..Default::default()
            })
            .await?;

        let mut record = SubagentRunRecord::new(
            accepted.run_id.clone(),
            child_key.clone(),
            params.requester_session_key.clone(),
            params.task,
        );
        record.requester_origin = params.requester_origin;
        record.requester_display_key = display_key;
        record.label = params.label;
        record.cleanup = params.cleanup;
        record.expects_completion_message = params.expects_completion_message;
        record.run_timeout_secs = run_timeout_secs;
        record.started_at = Some(Utc::now());
        record.last_status = RunStatus::Running;
        slot.register(record);

        info!(
            run_id = %accepted.run_id,
            parent = %params.requester_session_key,
            child = %child_key,
            "subagent spawned"
        );
        if let Some(events) = &self.events {
            events.publish(RunEvent::SubagentSpawned {
                run_id: accepted.run_id.clone(),
                parent_session_key: params.requester_session_key,
                child_session_key: child_key.clone(),
            });
        }

        Ok(SpawnResult {
            run_id: accepted.run_id,
            child_session_key: child_key,
        })
    }
}
