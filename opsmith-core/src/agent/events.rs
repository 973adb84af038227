use serde_json::Value;

use crate::llm::UsageMetadata;

/// Events streamed by the run loop while processing one user message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TurnStarted {
        turn_number: u64,
    },
    /// Final or intermediate agent text for the user.
    AgentText {
        text: String,
    },
    /// A thought summary surfaced by the transport, displayed separately
    /// from the final answer.
    Thought {
        text: String,
    },
    /// A generated plan awaiting approval.
    PlanPresented {
        text: String,
    },
    ToolCallStarted {
        tool_name: String,
        args: Value,
    },
    ToolCallCompleted {
        tool_name: String,
        is_error: bool,
    },
    Usage {
        usage: UsageMetadata,
    },
    /// A retryable failure; the loop is backing off before another attempt.
    Retrying {
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    /// A user-visible failure; the invocation ends after this event.
    Error {
        message: String,
    },
    TurnCompleted {
        turn_number: u64,
    },
}
