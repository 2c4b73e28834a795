use async_trait::async_trait;
use relay_core::{InputItem, Result, Role, ToolSpec};
use serde::{Deserialize, Serialize};

/// Credential selected for one attempt. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderAuth {
    pub profile_id: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAuth")
            .field("profile_id", &self.profile_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A request to an LLM provider.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// The model to use, e.g. "claude-sonnet-4-5" (provider-specific part).
    pub model: String,
    /// Ordered conversation items, tool calls and outputs included.
    pub input: Vec<InputItem>,
    /// Available tools.
    pub tools: Vec<ToolSpec>,
    /// System prompt (separate from input for providers that support it).
    pub system: Option<String>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature.
    pub temperature: f32,
    /// Server-side continuity token from the previous response.
    pub previous_response_id: Option<String>,
    /// Keep only the last N user turns of history when set.
    pub limit_history_turns: Option<usize>,
    /// Credential for this attempt; `None` lets the provider use its own default.
    pub auth: Option<ProviderAuth>,
}

impl LlmRequest {
    /// The input after applying `limit_history_turns`.
    pub fn windowed_input(&self) -> Vec<InputItem> {
        match self.limit_history_turns {
            Some(turns) => limit_history_turns(&self.input, turns),
            None => self.input.clone(),
        }
    }
}

/// Keep the last `turns` user turns. A turn starts at a user message; anything
/// before the first kept user message is dropped, leading system items excepted.
pub fn limit_history_turns(items: &[InputItem], turns: usize) -> Vec<InputItem> {
    let turns = turns.max(1);
    let user_starts: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| matches!(item, InputItem::Message { role: Role::User, .. }))
        .map(|(i, _)| i)
        .collect();

    if user_starts.len() <= turns {
        return items.to_vec();
    }
    let cut = user_starts[user_starts.len() - turns];

    let mut kept: Vec<InputItem> = items[..cut]
        .iter()
        .filter(|item| {
            matches!(
                item,
                InputItem::Message {
                    role: Role::System | Role::Developer,
                    ..
                }
            )
        })
        .cloned()
        .collect();
    kept.extend_from_slice(&items[cut..]);
    kept
}

/// A complete response from an LLM run.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Items produced by the model (assistant text, function calls).
    pub output: Vec<InputItem>,
    /// Final assistant text.
    pub text: String,
    /// Usage accumulated over every provider call made for this response.
    pub usage: Usage,
    /// Usage of the last provider call alone, when the provider reports it.
    pub last_call_usage: Option<Usage>,
    /// Continuity token for the next request.
    pub response_id: Option<String>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    /// Tokens occupying the context window on the prompt side.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens() == 0
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// Trait implemented by each upstream provider adapter.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider id, e.g. "anthropic", "openai". Used as the admission key.
    fn name(&self) -> &str;

    /// List available models.
    fn models(&self) -> Vec<String>;

    /// Run one request to completion.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Check if this provider is healthy / reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
