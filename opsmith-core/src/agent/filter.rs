//! Smart conversation filtering.
//!
//! Before context assembly, the outgoing message list is filtered down to
//! what the model actually needs from raw history: system messages, the
//! active tool-call chain, the current user message, and up to two recent
//! completed conversation segments, preferring segments that contain tool
//! calls. Older history is dropped; the context assembler re-surfaces it in
//! compressed form.

use tracing::debug;

use crate::llm::{Message, MessageRole};

/// Marker prefix of an injected context block.
pub const CONTEXT_INJECTION_PREFIX: &str = "SYSTEM CONTEXT (JSON):";

/// Completed segments preserved per request.
const SEGMENT_LIMIT: usize = 2;

/// Apply the smart conversation filter in place.
pub fn apply_smart_filter(contents: &mut Vec<Message>, current_user_message: &str) {
    let original_count = contents.len();

    let mut system_messages = Vec::new();
    let mut context_injections = Vec::new();
    let mut segments: Vec<Vec<Message>> = Vec::new();

    for message in contents.drain(..) {
        if message.role == MessageRole::System {
            system_messages.push(message);
            continue;
        }
        if message.role == MessageRole::User
            && message.content.starts_with(CONTEXT_INJECTION_PREFIX)
        {
            context_injections.push(message);
            continue;
        }
        // A user message opens a new conversation segment; everything that
        // follows (assistant replies, tool calls, tool results) belongs to
        // it.
        if message.role == MessageRole::User || segments.is_empty() {
            segments.push(vec![message]);
        } else if let Some(segment) = segments.last_mut() {
            segment.push(message);
        }
    }

    // The segment holding the current user message is the active one,
    // including any in-flight tool-call chain behind it.
    let active_segment = match segments
        .iter()
        .rposition(|segment| {
            segment
                .iter()
                .any(|message| {
                    message.role == MessageRole::User && message.content == current_user_message
                })
        }) {
        Some(position) => Some(segments.remove(position)),
        None => None,
    };

    // Keep the most recent completed segments, preferring ones with tool
    // activity but always keeping at least one.
    let mut kept_segments: Vec<Vec<Message>> = Vec::new();
    let tail_start = segments.len().saturating_sub(SEGMENT_LIMIT);
    for segment in segments.drain(..).skip(tail_start) {
        let has_tools = segment.iter().any(segment_message_has_tools);
        if has_tools || kept_segments.is_empty() {
            kept_segments.push(segment);
        }
    }

    let mut filtered = Vec::with_capacity(original_count);
    filtered.extend(system_messages);
    filtered.extend(context_injections);
    for segment in kept_segments {
        filtered.extend(segment);
    }
    match active_segment {
        Some(segment) => filtered.extend(segment),
        None => filtered.push(Message::user(current_user_message)),
    }

    debug!(
        original = original_count,
        filtered = filtered.len(),
        "smart conversation filter applied"
    );
    *contents = filtered;
}

fn segment_message_has_tools(message: &Message) -> bool {
    message.has_tool_calls() || message.is_tool_result()
}
