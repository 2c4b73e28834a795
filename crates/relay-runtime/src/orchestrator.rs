//! Drives one logical run across candidate models and credential profiles.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_config::{RelayConfig, SelectionStrategy, resolve_context_window};
use relay_core::{
    EventBus, FailureClass, InputItem, ModelRef, RelayError, Run, RunEvent, RunStatus, ToolSpec,
};
use relay_llm::classify::user_message;
use relay_llm::{CarriedCalls, LlmProvider, LlmRequest, LlmResponse, ProviderRegistry, ToolChainPayload};

use crate::auth_profiles::CredentialRotator;
use crate::executor::{AttemptContext, AttemptOutcome, RunAttemptExecutor};
use crate::usage::{PersistUsage, UsageRecorder};

/// Same-profile retries allowed after a context overflow.
const MAX_OVERFLOW_RETRIES: u32 = 3;

/// Same-profile retries allowed after a tool-chain corruption.
const MAX_CORRUPTION_RETRIES: u32 = 1;

/// Orchestration settings, derived from `[agent]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub model: String,
    pub fallbacks: Vec<String>,
    pub selection: SelectionStrategy,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_window: usize,
    pub request_timeout: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    pub retry_history_turns: usize,
    pub timeout_retries: u32,
}

impl OrchestratorConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        let agent = &config.agent;
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            model: agent.model.clone(),
            fallbacks: agent.fallbacks.clone(),
            selection: agent.selection,
            system_prompt: agent.system_prompt.clone(),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            context_window: agent.context_window,
            request_timeout: secs(agent.request_timeout_secs),
            attempt_timeout: secs(agent.attempt_timeout_secs),
            retry_history_turns: agent.retry_history_turns.max(1),
            timeout_retries: agent.timeout_retries,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// One user turn to execute.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_key: String,
    pub input: Vec<InputItem>,
    pub previous_response_id: Option<String>,
    pub carried: CarriedCalls,
    pub tools: Vec<ToolSpec>,
    /// Overrides the configured primary model.
    pub model: Option<String>,
    /// Overrides the configured fallback list.
    pub fallbacks: Option<Vec<String>>,
    /// Initial history window; `None` sends the full history.
    pub limit_history_turns: Option<usize>,
    /// Temporary model override: record raw usage only.
    pub skip_model_and_context_update: bool,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(session_key: impl Into<String>, input: Vec<InputItem>) -> Self {
        Self {
            session_key: session_key.into(),
            input,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = Some(fallbacks);
        self
    }

    pub fn with_previous_response_id(mut self, id: impl Into<String>) -> Self {
        self.previous_response_id = Some(id.into());
        self
    }

    pub fn with_carried(mut self, carried: CarriedCalls) -> Self {
        self.carried = carried;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run under a temporary model without touching the session's model bookkeeping.
    pub fn as_override(mut self) -> Self {
        self.skip_model_and_context_update = true;
        self
    }
}

/// What happened on one attempt, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub profile_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub class: Option<FailureClass>,
    pub error: Option<String>,
    /// The candidate was skipped without calling the provider.
    pub skipped: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run: Run,
    pub response: Option<LlmResponse>,
    pub attempts: Vec<AttemptSummary>,
    pub error: Option<RelayError>,
    /// Text to show the end user when the run did not succeed.
    pub user_message: Option<String>,
    /// The tool chain as finally sent, after any repair.
    pub payload: ToolChainPayload,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.run.status == RunStatus::Ok
    }
}

/// Next history window after a context overflow, or `None` when it cannot shrink.
pub fn shrink_history(current: Option<usize>, retry_turns: usize) -> Option<usize> {
    match current {
        None => Some(retry_turns),
        Some(n) if n > retry_turns => Some(retry_turns),
        Some(n) if n > 1 => Some((n / 2).max(1)),
        Some(_) => None,
    }
}

fn session_hash(session_key: &str) -> u32 {
    session_key
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

struct Current {
    target: ModelRef,
    provider: Arc<dyn LlmProvider>,
    profile_id: String,
}

/// Why the loop stopped without a success.
enum Stop {
    Fatal(FailureClass, RelayError),
    TimedOut(RelayError),
    Cancelled,
    Exhausted,
}

pub struct RunOrchestrator {
    registry: ProviderRegistry,
    rotator: Arc<CredentialRotator>,
    executor: RunAttemptExecutor,
    usage: UsageRecorder,
    events: EventBus,
    config: RwLock<OrchestratorConfig>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl RunOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        rotator: Arc<CredentialRotator>,
        executor: RunAttemptExecutor,
        usage: UsageRecorder,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            rotator,
            executor,
            usage,
            events,
            config: RwLock::new(config),
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: OrchestratorConfig) {
        *self.config.write() = config;
    }

    /// Ordered, de-duplicated candidates for a run.
    pub fn candidate_chain(&self, request: &RunRequest, config: &OrchestratorConfig) -> Vec<ModelRef> {
        let primary = request.model.clone().unwrap_or_else(|| config.model.clone());
        let fallbacks = request
            .fallbacks
            .clone()
            .unwrap_or_else(|| config.fallbacks.clone());

        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        for raw in std::iter::once(primary).chain(fallbacks) {
            let target = match ModelRef::parse(&raw) {
                Some(target) => target,
                None => match self.registry.resolve(&raw) {
                    Ok((_, target)) => target,
                    Err(e) => {
                        warn!(model = %raw, error = %e, "dropping unresolvable candidate");
                        continue;
                    }
                },
            };
            if seen.insert(target.key()) {
                chain.push(target);
            }
        }
        if chain.len() < 2 {
            return chain;
        }

        let start = match config.selection {
            SelectionStrategy::Primary => 0,
            SelectionStrategy::RoundRobin => {
                let pool: Vec<String> = chain.iter().map(ModelRef::key).collect();
                let mut cursors = self.round_robin.lock();
                let cursor = cursors.entry(pool.join(",")).or_insert(0);
                let start = *cursor % chain.len();
                *cursor = cursor.wrapping_add(1);
                start
            }
            SelectionStrategy::StickySession => {
                session_hash(&request.session_key) as usize % chain.len()
            }
        };
        chain.rotate_left(start);
        chain
    }

    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let config = self.config();
        let chain = self.candidate_chain(&request, &config);
        let head = chain
            .first()
            .cloned()
            .unwrap_or_else(|| ModelRef::new("", ""));
        let mut run = Run::new(request.session_key.clone(), &head);
        let mut payload = ToolChainPayload {
            items: request.input.clone(),
            previous_response_id: request.previous_response_id.clone(),
            carried: request.carried.clone(),
        };
        let mut attempts: Vec<AttemptSummary> = Vec::new();

        if chain.is_empty() {
            let error = RelayError::Config("no usable model configured for this run".into());
            run.finish(RunStatus::Error);
            self.publish_finished(&run);
            return RunOutcome {
                user_message: Some(user_message(FailureClass::Unknown, &error.to_string())),
                run,
                response: None,
                attempts,
                error: Some(error),
                payload,
            };
        }

        run.status = RunStatus::Running;
        info!(
            run_id = %run.run_id,
            session_key = %run.session_key,
            candidates = chain.len(),
            "run started"
        );
        self.events.publish(RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            session_key: run.session_key.clone(),
            provider: head.provider.clone(),
            model: head.model.clone(),
        });

        let deadline = config.request_timeout.map(|d| Instant::now() + d);
        let candidate_profiles: usize = chain
            .iter()
            .map(|t| self.rotator.profile_order(&t.provider).len())
            .sum();
        let max_attempts = candidate_profiles
            + config.timeout_retries as usize
            + MAX_OVERFLOW_RETRIES as usize
            + MAX_CORRUPTION_RETRIES as usize;

        let mut history_limit = request.limit_history_turns;
        let mut index = 0usize;
        let mut tried: HashSet<String> = HashSet::new();
        let mut current: Option<Current> = None;
        let mut timeouts = 0u32;
        let mut overflows = 0u32;
        let mut corruptions = 0u32;
        let mut last_class: Option<FailureClass> = None;
        let mut cooling_provider: Option<String> = None;

        let stop = loop {
            if run.attempt_count as usize >= max_attempts {
                warn!(run_id = %run.run_id, max_attempts, "attempt bound reached");
                break Stop::Exhausted;
            }
            if request.cancel.is_cancelled() {
                break Stop::Cancelled;
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                break Stop::TimedOut(RelayError::Timeout("run deadline exceeded".into()));
            }

            if current.is_none() {
                current = self.next_candidate(
                    &chain,
                    &mut index,
                    &mut tried,
                    &mut attempts,
                    &mut cooling_provider,
                );
            }
            let Some(Current {
                target,
                provider,
                profile_id,
            }) = current.as_ref()
            else {
                break Stop::Exhausted;
            };

            let auth = match self.rotator.resolve_auth(profile_id).await {
                Ok(auth) => auth,
                Err(e) => {
                    warn!(profile_id = %profile_id, error = %e, "credential unavailable; rotating");
                    attempts.push(AttemptSummary {
                        profile_id: Some(profile_id.clone()),
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        class: Some(FailureClass::Auth { recoverable: true }),
                        error: Some(e.to_string()),
                        skipped: true,
                    });
                    tried.insert(profile_id.clone());
                    current = None;
                    continue;
                }
            };

            let request_template = LlmRequest {
                model: target.model.clone(),
                tools: request.tools.clone(),
                system: config.system_prompt.clone(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                limit_history_turns: history_limit,
                auth: Some(auth),
                ..Default::default()
            };
            let timeout = match (config.attempt_timeout, remaining) {
                (Some(a), Some(r)) => Some(a.min(r)),
                (a, r) => a.or(r),
            };

            run.attempt_count += 1;
            run.provider = target.provider.clone();
            run.model = target.model.clone();

            let attempt = self
                .executor
                .attempt(AttemptContext {
                    provider: Arc::clone(provider),
                    target,
                    profile_id,
                    request: request_template,
                    payload: &mut payload,
                    cancel: &request.cancel,
                    timeout,
                })
                .await;

            let (class, error) = match attempt.outcome {
                AttemptOutcome::Success(response) => {
                    attempts.push(AttemptSummary {
                        profile_id: Some(profile_id.clone()),
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        class: None,
                        error: None,
                        skipped: false,
                    });
                    self.on_success(&request, &config, target, profile_id, &response).await;
                    run.finish(RunStatus::Ok);
                    info!(
                        run_id = %run.run_id,
                        provider = %target.provider,
                        model = %target.model,
                        attempts = run.attempt_count,
                        elapsed_ms = attempt.elapsed.as_millis() as u64,
                        "run finished"
                    );
                    self.publish_finished(&run);
                    return RunOutcome {
                        run,
                        response: Some(response),
                        attempts,
                        error: None,
                        user_message: None,
                        payload,
                    };
                }
                AttemptOutcome::Cancelled => break Stop::Cancelled,
                AttemptOutcome::Failed { class, error } => (class, error),
            };

            last_class = Some(class);
            attempts.push(AttemptSummary {
                profile_id: Some(profile_id.clone()),
                provider: target.provider.clone(),
                model: target.model.clone(),
                class: Some(class),
                error: Some(error.to_string()),
                skipped: false,
            });
            self.events.publish(RunEvent::AttemptFailed {
                run_id: run.run_id.clone(),
                attempt: run.attempt_count,
                profile_id: profile_id.clone(),
                provider: target.provider.clone(),
                model: target.model.clone(),
                class,
            });
            if let Err(e) = self
                .rotator
                .mark_failure(profile_id, class, Some(&target.model))
                .await
            {
                warn!(profile_id = %profile_id, error = %e, "failed to record profile failure");
            }

            match class {
                c if c.is_fatal() => break Stop::Fatal(c, error),
                c if c.triggers_rotation() => {
                    info!(
                        run_id = %run.run_id,
                        profile_id = %profile_id,
                        provider = %target.provider,
                        class = %c,
                        "rotating to next credential"
                    );
                    self.events.publish(RunEvent::ProfileRotated {
                        run_id: run.run_id.clone(),
                        from_profile: profile_id.clone(),
                        provider: target.provider.clone(),
                    });
                    let retry_turns = config.retry_history_turns;
                    history_limit = Some(history_limit.map_or(retry_turns, |n| n.min(retry_turns)));
                    tried.insert(profile_id.clone());
                    current = None;
                }
                FailureClass::Timeout => {
                    timeouts += 1;
                    if timeouts > config.timeout_retries {
                        break Stop::TimedOut(error);
                    }
                    debug!(run_id = %run.run_id, timeouts, "retrying after timeout");
                }
                FailureClass::ContextOverflow => {
                    overflows += 1;
                    match shrink_history(history_limit, config.retry_history_turns) {
                        Some(turns) if overflows <= MAX_OVERFLOW_RETRIES => {
                            info!(run_id = %run.run_id, turns, "context overflow; shrinking history");
                            history_limit = Some(turns);
                        }
                        _ => break Stop::Fatal(class, error),
                    }
                }
                FailureClass::ToolChainCorruption => {
                    corruptions += 1;
                    if corruptions > MAX_CORRUPTION_RETRIES {
                        break Stop::Fatal(class, error);
                    }
                    info!(run_id = %run.run_id, "retrying with repaired tool-call chain");
                }
                // Every remaining class is rotation or fatal, matched above.
                _ => break Stop::Fatal(class, error),
            }
        };

        self.finish_failed(run, stop, attempts, last_class, cooling_provider, payload)
    }

    /// Advance to the next usable (candidate, profile) pair.
    fn next_candidate(
        &self,
        chain: &[ModelRef],
        index: &mut usize,
        tried: &mut HashSet<String>,
        attempts: &mut Vec<AttemptSummary>,
        cooling_provider: &mut Option<String>,
    ) -> Option<Current> {
        while let Some(target) = chain.get(*index) {
            let provider = match self.registry.resolve_ref(target) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(model = %target, error = %e, "skipping candidate without provider");
                    attempts.push(AttemptSummary {
                        profile_id: None,
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        class: None,
                        error: Some(e.to_string()),
                        skipped: true,
                    });
                    *index += 1;
                    tried.clear();
                    continue;
                }
            };

            let order = self.rotator.profile_order(&target.provider);
            if let Some(profile_id) = self.rotator.resolve_profile(&order, tried, Some(&target.model)) {
                return Some(Current {
                    target: target.clone(),
                    provider,
                    profile_id,
                });
            }

            if tried.is_empty() {
                debug!(model = %target, "every profile is cooling down; skipping candidate");
                attempts.push(AttemptSummary {
                    profile_id: None,
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    class: Some(FailureClass::RateLimit),
                    error: Some(format!("all profiles for {} are in cooldown", target.provider)),
                    skipped: true,
                });
                cooling_provider.get_or_insert_with(|| target.provider.clone());
            }
            *index += 1;
            tried.clear();
        }
        None
    }

    async fn on_success(
        &self,
        request: &RunRequest,
        config: &OrchestratorConfig,
        target: &ModelRef,
        profile_id: &str,
        response: &LlmResponse,
    ) {
        if let Err(e) = self.rotator.mark_success(profile_id, Some(&target.model)).await {
            warn!(profile_id, error = %e, "failed to record profile success");
        }
        let context_tokens = resolve_context_window(config.context_window, &target.model) as u64;
        let persisted = self
            .usage
            .persist(PersistUsage {
                session_key: request.session_key.clone(),
                usage: Some(response.usage),
                last_call_usage: response.last_call_usage,
                model_used: Some(target.model.clone()),
                provider_used: Some(target.provider.clone()),
                context_tokens_used: Some(context_tokens),
                skip_model_and_context_update: request.skip_model_and_context_update,
            })
            .await;
        if let Err(e) = persisted {
            warn!(session_key = %request.session_key, error = %e, "failed to record session usage");
        }
    }

    fn finish_failed(
        &self,
        mut run: Run,
        stop: Stop,
        attempts: Vec<AttemptSummary>,
        last_class: Option<FailureClass>,
        cooling_provider: Option<String>,
        payload: ToolChainPayload,
    ) -> RunOutcome {
        let (status, error, user_text) = match stop {
            Stop::Fatal(class, error) => {
                let detail = error.to_string();
                let error = RelayError::Classified {
                    class,
                    provider: run.provider.clone(),
                    model: run.model.clone(),
                    message: detail.clone(),
                };
                (RunStatus::Error, error, Some(user_message(class, &detail)))
            }
            Stop::TimedOut(error) => {
                let text = user_message(FailureClass::Timeout, &error.to_string());
                (RunStatus::Timeout, error, Some(text))
            }
            Stop::Cancelled => (RunStatus::Error, RelayError::Cancelled, None),
            Stop::Exhausted => {
                let made_calls = attempts.iter().any(|a| !a.skipped);
                let error = match cooling_provider {
                    Some(provider) if !made_calls => RelayError::ProfilesExhausted { provider },
                    _ => RelayError::AllCandidatesFailed {
                        attempts: attempts.len(),
                        summary: attempts
                            .iter()
                            .map(|a| {
                                format!(
                                    "{}/{}: {}",
                                    a.provider,
                                    a.model,
                                    a.error.as_deref().unwrap_or("failed")
                                )
                            })
                            .collect::<Vec<_>>()
                            .join(" | "),
                    },
                };
                let class = last_class.unwrap_or(FailureClass::RateLimit);
                let text = user_message(class, &error.to_string());
                (RunStatus::Error, error, Some(text))
            }
        };

        run.finish(status);
        warn!(
            run_id = %run.run_id,
            status = %run.status,
            attempts = run.attempt_count,
            error = %error,
            "run failed"
        );
        self.publish_finished(&run);
        RunOutcome {
            run,
            response: None,
            attempts,
            error: Some(error),
            user_message: user_text,
            payload,
        }
    }

    fn publish_finished(&self, run: &Run) {
        self.events.publish(RunEvent::RunFinished {
            run_id: run.run_id.clone(),
            status: run.status,
            attempts: run.attempt_count,
        });
    }
}
