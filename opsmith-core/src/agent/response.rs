//! Classification of model responses.
//!
//! A response is fully classified before any tool dispatch: text parts,
//! thought summaries, and function calls are separated, and a display
//! response is synthesized that never repeats thoughts the user has
//! already seen.

use crate::llm::{FunctionCall, LlmResponse, Part, UsageMetadata};

/// A response split into its classified parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedResponse {
    pub text_parts: Vec<String>,
    pub thought_summaries: Vec<String>,
    pub function_calls: Vec<FunctionCall>,
}

impl ProcessedResponse {
    pub fn text(&self) -> String {
        self.text_parts.concat()
    }

    pub fn has_function_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

/// Split a response into text, thoughts, and function calls.
pub fn process_response(response: &LlmResponse) -> ProcessedResponse {
    let mut processed = ProcessedResponse::default();
    for part in &response.parts {
        match part {
            Part::Text(text) => processed.text_parts.push(text.clone()),
            Part::Thought(text) => processed.thought_summaries.push(text.clone()),
            Part::FunctionCall(call) => processed.function_calls.push(call.clone()),
        }
    }
    processed
}

/// Synthesize the user-facing response when thought summaries were already
/// displayed separately and no function calls exist. Returns `None` when
/// filtering would leave nothing, in which case the response is suppressed
/// entirely.
pub fn filtered_display_response(
    processed: &ProcessedResponse,
    usage: Option<UsageMetadata>,
) -> Option<LlmResponse> {
    if processed.has_function_calls() {
        return None;
    }
    let text = processed.text();
    if text.is_empty() {
        return None;
    }
    let mut response = LlmResponse::from_text(text);
    response.usage = usage;
    Some(response)
}
