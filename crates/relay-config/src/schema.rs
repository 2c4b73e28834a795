use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration, as read from `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub agent: AgentConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub subagents: SubagentConfig,
    pub admission: AdmissionConfig,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

/// How the candidate chain is ordered for each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Always start at the primary model.
    #[default]
    Primary,
    /// Rotate the starting candidate on every run.
    RoundRobin,
    /// Start at a candidate chosen by hashing the session key.
    StickySession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary model identifier, e.g. "anthropic/claude-sonnet-4-5".
    pub model: String,
    /// Models tried in order after the primary.
    pub fallbacks: Vec<String>,
    pub selection: SelectionStrategy,
    /// System prompt injected at the start of every run.
    pub system_prompt: Option<String>,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Context window size in tokens. If 0, auto-detected from model name.
    pub context_window: usize,
    /// Wall-clock budget for a whole run, retries included. 0 = no limit.
    pub request_timeout_secs: u64,
    /// Budget for a single provider attempt. 0 = no limit.
    pub attempt_timeout_secs: u64,
    /// History window applied after a credential rotation or context overflow.
    pub retry_history_turns: usize,
    /// Extra attempts on the same profile after a timeout.
    pub timeout_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-5".into(),
            fallbacks: vec![],
            selection: SelectionStrategy::Primary,
            system_prompt: None,
            max_tokens: 8192,
            temperature: 0.7,
            context_window: 0,
            request_timeout_secs: 600,
            attempt_timeout_secs: 300,
            retry_history_turns: 5,
            timeout_retries: 1,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Maximum simultaneous upstream calls. None = unbounded.
    pub max_concurrent: Option<usize>,
    /// Models served by this provider, used for bare-model resolution.
    pub models: Vec<String>,
}

// ── Auth profiles ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Persisted auth-profile store. None = `~/.relay/auth-profiles.json`.
    pub store_path: Option<PathBuf>,
    /// Explicit profile order per provider.
    pub order: HashMap<String, Vec<String>>,
    /// Failure counts older than this are forgotten.
    pub failure_window_hours: u64,
    /// Upper bound on a single cooldown.
    pub max_cooldown_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            order: HashMap::new(),
            failure_window_hours: 24,
            max_cooldown_secs: 3600,
        }
    }
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persisted session store. None = `~/.relay/sessions.json`.
    pub store_path: Option<PathBuf>,
}

// ── Subagents ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    /// Overall window for waiting on a child run before announcing.
    pub wait_timeout_secs: u64,
    /// Cap on a single `agent.wait` probe.
    pub probe_timeout_ms: u64,
    /// Terminal records older than this are swept.
    pub archive_after_minutes: u64,
    /// Default child run timeout. 0 = none.
    pub run_timeout_secs: u64,
    /// Concurrent children allowed per requester session.
    pub max_children_per_session: usize,
    /// Agent id used in child session keys.
    pub agent_id: String,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 60,
            probe_timeout_ms: 2000,
            archive_after_minutes: 60,
            run_timeout_secs: 0,
            max_children_per_session: 5,
            agent_id: "main".into(),
        }
    }
}

// ── Admission ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// A permit held longer than this is force-released.
    pub safety_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            safety_timeout_secs: 600,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl RelayConfig {
    /// `max_concurrent` per provider, for providers that set one.
    pub fn admission_limits(&self) -> HashMap<String, usize> {
        self.providers
            .iter()
            .filter_map(|(id, p)| p.max_concurrent.map(|limit| (id.clone(), limit)))
            .collect()
    }

    /// Primary model followed by fallbacks, in configured order.
    pub fn model_chain(&self) -> Vec<String> {
        std::iter::once(self.agent.model.clone())
            .chain(self.agent.fallbacks.iter().cloned())
            .collect()
    }

    fn relay_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
    }

    pub fn auth_store_path(&self) -> PathBuf {
        self.auth
            .store_path
            .clone()
            .unwrap_or_else(|| Self::relay_dir().join("auth-profiles.json"))
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.session
            .store_path
            .clone()
            .unwrap_or_else(|| Self::relay_dir().join("sessions.json"))
    }
}

/// Resolve context window size for a model. If the user configured a specific
/// value, use that. Otherwise, infer from the model name.
pub fn resolve_context_window(config_value: usize, model: &str) -> usize {
    if config_value > 0 {
        return config_value;
    }
    let m = model.to_lowercase();
    // Claude models
    if m.contains("claude") {
        return 200_000;
    }
    // GPT-5 and variants
    if m.contains("gpt-5") || m.contains("gpt5") {
        return 400_000;
    }
    // GPT-4.1
    if m.contains("gpt-4.1") {
        return 1_000_000;
    }
    // GPT-4o and variants
    if m.contains("gpt-4o") || m.contains("gpt-4-turbo") {
        return 128_000;
    }
    // o1 / o3 / o4 reasoning models
    if m.contains("o1") || m.contains("o3") || m.contains("o4-mini") {
        return 200_000;
    }
    // Gemini
    if m.contains("gemini") {
        return 1_000_000;
    }
    // Llama 3 models
    if m.contains("llama3") || m.contains("llama-3") {
        return 128_000;
    }
    // Mistral / Mixtral
    if m.contains("mistral") || m.contains("mixtral") {
        return 32_768;
    }
    // DeepSeek
    if m.contains("deepseek") {
        return 128_000;
    }
    // Default fallback
    128_000
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

fn check_model_ref(field: String, model: &str, warnings: &mut Vec<ConfigWarning>) {
    if model.trim().is_empty() {
        warnings.push(ConfigWarning {
            field,
            message: "model is empty".into(),
            severity: WarningSeverity::Error,
            hint: Some("Set to e.g. 'anthropic/claude-sonnet-4-5' or 'openai/gpt-4o'".into()),
        });
    } else if !model.contains('/') {
        warnings.push(ConfigWarning {
            field,
            message: format!("model '{}' should be in 'provider/model' format", model),
            severity: WarningSeverity::Warning,
            hint: Some("Bare names only resolve when a provider lists them under providers.<id>.models".into()),
        });
    }
}

impl RelayConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Models ───
        check_model_ref("agent.model".into(), &self.agent.model, &mut warnings);
        for (i, fallback) in self.agent.fallbacks.iter().enumerate() {
            check_model_ref(format!("agent.fallbacks[{i}]"), fallback, &mut warnings);
        }
        let chain = self.model_chain();
        for (i, model) in chain.iter().enumerate() {
            if chain[..i].contains(model) {
                warnings.push(ConfigWarning {
                    field: "agent.fallbacks".into(),
                    message: format!("'{}' appears more than once in the model chain", model),
                    severity: WarningSeverity::Info,
                    hint: Some("Duplicates are skipped at run time".into()),
                });
            }
        }

        // ── Temperature ───
        if self.agent.temperature < 0.0 || self.agent.temperature > 2.0 {
            warnings.push(ConfigWarning {
                field: "agent.temperature".into(),
                message: format!("temperature {} is out of range", self.agent.temperature),
                severity: WarningSeverity::Error,
                hint: Some("Temperature must be between 0.0 and 2.0".into()),
            });
        }

        // ── Max tokens ───
        if self.agent.max_tokens == 0 {
            warnings.push(ConfigWarning {
                field: "agent.max_tokens".into(),
                message: "max_tokens is 0, agent won't produce output".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 8192".into()),
            });
        }

        // ── Retry shaping ───
        if self.agent.retry_history_turns == 0 {
            warnings.push(ConfigWarning {
                field: "agent.retry_history_turns".into(),
                message: "retry_history_turns must be at least 1".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 5".into()),
            });
        }
        if self.agent.request_timeout_secs > 0
            && self.agent.attempt_timeout_secs > self.agent.request_timeout_secs
        {
            warnings.push(ConfigWarning {
                field: "agent.attempt_timeout_secs".into(),
                message: "attempt timeout exceeds the whole-run timeout".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The run deadline will cut attempts short".into()),
            });
        }

        // ── Providers ───
        for (id, provider) in &self.providers {
            if provider.max_concurrent == Some(0) {
                warnings.push(ConfigWarning {
                    field: format!("providers.{}.max_concurrent", id),
                    message: "max_concurrent must be at least 1".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("Remove the key to leave the provider unbounded".into()),
                });
            }
        }

        // ── Auth order ───
        for (provider, order) in &self.auth.order {
            if order.is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("auth.order.{}", provider),
                    message: "empty profile order".into(),
                    severity: WarningSeverity::Warning,
                    hint: Some("Remove the entry to use stored profiles in default order".into()),
                });
            }
        }
        if self.auth.max_cooldown_secs == 0 {
            warnings.push(ConfigWarning {
                field: "auth.max_cooldown_secs".into(),
                message: "cooldowns are disabled; rate-limited profiles are retried at once".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The default is 3600".into()),
            });
        }

        // ── Subagents ───
        if self.subagents.probe_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "subagents.probe_timeout_ms".into(),
                message: "probe timeout must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 2000".into()),
            });
        } else if self.subagents.probe_timeout_ms > 2000 {
            warnings.push(ConfigWarning {
                field: "subagents.probe_timeout_ms".into(),
                message: format!(
                    "probe timeout {}ms is above the 2000ms cap and will be clamped",
                    self.subagents.probe_timeout_ms
                ),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }
        if self.subagents.run_timeout_secs > 0
            && self.subagents.wait_timeout_secs >= self.subagents.run_timeout_secs
        {
            warnings.push(ConfigWarning {
                field: "subagents.wait_timeout_secs".into(),
                message: "wait window should be shorter than the child run timeout".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The wait window is clamped below run_timeout_secs".into()),
            });
        }
        if self.subagents.max_children_per_session == 0 {
            warnings.push(ConfigWarning {
                field: "subagents.max_children_per_session".into(),
                message: "subagent spawning is disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Admission ───
        if self.admission.safety_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "admission.safety_timeout_secs".into(),
                message: "safety timeout must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 600 (10 minutes)".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
