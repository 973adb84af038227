//! Universal LLM transport abstraction.
//!
//! The agent core never talks to a concrete API directly. It builds an
//! [`LlmRequest`] (role-tagged messages, tool schemas, generation config),
//! hands it to an [`LlmProvider`], and pattern-matches the returned
//! [`LlmResponse`] parts: plain text, thought summaries, and function calls.

pub mod provider;
pub mod types;

pub use provider::{LlmError, LlmProvider};
pub use types::{
    FunctionCall, GenerationConfig, LlmRequest, LlmResponse, Message, MessageRole, Part,
    ThinkingConfig, ToolDefinition, ToolResultPayload, UsageMetadata,
};
