use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
}

/// One entry of the input sent upstream.
///
/// Tool calls and their outputs are separate items linked by `call_id`, which is
/// how responses-style providers model multi-turn tool use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: Role,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl InputItem {
    pub fn user(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    pub fn call(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::FunctionCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    /// True for function calls and their outputs.
    pub fn is_tool_item(&self) -> bool {
        !matches!(self, Self::Message { .. })
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            Self::Message { .. } => None,
        }
    }

    /// Text of a message item, `None` for tool items.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Rough token estimate: ~4 chars per token, minimum 1.
    pub fn estimate_tokens(&self) -> usize {
        let chars = match self {
            Self::Message { content, .. } => content.len() + 16,
            Self::FunctionCall {
                call_id,
                name,
                arguments,
            } => call_id.len() + name.len() + arguments.to_string().len(),
            Self::FunctionCallOutput { call_id, output } => call_id.len() + output.len(),
        };
        (chars / 4).max(1)
    }
}
