use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role attached to a request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    #[default]
    User,
    Assistant,
    /// Tool-result message handed back to the model after a function call.
    Tool,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            id: None,
        }
    }
}

/// Payload of a tool-result message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Universal request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    /// Function calls carried by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,
    /// Result payload carried by a tool-role message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<FunctionCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: calls,
            ..Default::default()
        }
    }

    pub fn tool_response(tool_name: impl Into<String>, value: Value) -> Self {
        Self {
            role: MessageRole::Tool,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_result: Some(ToolResultPayload {
                tool_name: tool_name.into(),
                value,
                call_id: None,
            }),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        self.tool_result.is_some()
    }
}

/// Extended-thinking configuration forwarded to providers that support it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

/// Generation parameters for a single LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

/// Schema describing one tool exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the argument object.
    pub parameters: Value,
}

/// Universal LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LlmRequest {
    pub model: String,
    pub contents: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub config: GenerationConfig,
}

impl LlmRequest {
    /// Content of the last user-role message, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.contents
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }
}

/// One part of a model response.
///
/// The transport's duck-typed response shapes collapse into this algebraic
/// type; extraction downstream is a pattern match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    /// Internal reasoning surfaced by the transport as a thought summary.
    Thought(String),
    FunctionCall(FunctionCall),
}

impl Part {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_thought(&self) -> Option<&str> {
        match self {
            Part::Thought(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }
}

/// Token accounting reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UsageMetadata {
    pub prompt_token_count: u32,
    pub candidates_token_count: u32,
    pub total_token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u32>,
}

/// Universal LLM response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LlmResponse {
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
    /// Provider payload kept for diagnostics; never interpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl LlmResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Text(text.into())],
            usage: None,
            raw: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Concatenated text parts, or `None` when the response carries no text.
    pub fn text(&self) -> Option<String> {
        let joined: String = self
            .parts
            .iter()
            .filter_map(|part| part.as_text())
            .collect();
        if joined.is_empty() { None } else { Some(joined) }
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(|part| part.as_function_call())
            .collect()
    }

    pub fn thoughts(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| part.as_thought())
            .collect()
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Part::FunctionCall(_)))
    }
}
