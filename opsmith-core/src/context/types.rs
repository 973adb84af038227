use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored snippet of repository code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub file_path: String,
    pub code: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Turn number of the last access.
    pub last_accessed: u64,
    pub relevance_score: f64,
    pub token_count: usize,
}

/// A stored tool result with its human-readable summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToolResult {
    pub tool_name: String,
    pub result_summary: String,
    pub full_result: Value,
    pub turn_number: u64,
    pub is_error: bool,
    pub relevance_score: f64,
    /// Token count of the summary, not the full result.
    pub token_count: usize,
}

/// The context manager's view of one conversation turn, with precomputed
/// token counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationTurn {
    pub turn_number: u64,
    pub user_message: Option<String>,
    pub agent_message: Option<String>,
    pub tool_calls: Vec<Value>,
    pub user_message_tokens: usize,
    pub agent_message_tokens: usize,
    pub tool_calls_tokens: usize,
}

impl ConversationTurn {
    pub fn total_tokens(&self) -> usize {
        self.user_message_tokens + self.agent_message_tokens + self.tool_calls_tokens
    }
}

/// Scalar per-conversation context state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContextState {
    pub core_goal: String,
    pub current_phase: String,
    pub key_decisions: Vec<String>,
    pub last_modified_files: Vec<String>,
    pub core_goal_tokens: usize,
    pub current_phase_tokens: usize,
}
