//! Tool-result summarization.
//!
//! Whenever a tool result is recorded without an externally supplied
//! summary, one is generated here: short, human-readable, and bounded by
//! per-tool-kind truncation limits so summaries never dominate the context
//! budget.

use serde_json::Value;

use crate::config::SummaryLimits;

const TRUNCATION_SUFFIX: &str = " (truncated due to length)";

/// Keywords whose presence marks file content as code.
const CODE_KEYWORDS: &[&str] = &["def ", "class ", "import ", "function("];

/// Tools summarized as file reads.
const FILE_READ_TOOLS: &[&str] = &["read_file", "read_file_content"];

/// Tools summarized as shell commands.
const SHELL_TOOLS: &[&str] = &["execute_shell", "execute_vetted_shell_command"];

/// Tools summarized as searches.
const SEARCH_TOOLS: &[&str] = &[
    "code_search",
    "codebase_search",
    "ripgrep_code_search",
    "retrieve_code_context",
];

/// Keys extracted from generic dict results, in order.
const IMPORTANT_KEYS: &[&str] = &[
    "status", "message", "summary", "error", "output", "stdout", "stderr",
];

/// Whether a tool result value signals an error.
pub fn is_error_result(result: &Value) -> bool {
    match result {
        Value::Object(map) => {
            map.get("status").and_then(Value::as_str) == Some("error")
                || map
                    .get("error")
                    .is_some_and(|error| !error.is_null() && *error != Value::String(String::new()))
        }
        _ => false,
    }
}

/// Generate a bounded summary for a tool result.
pub fn generate_summary(tool_name: &str, result: &Value, limits: &SummaryLimits) -> String {
    let summary = if FILE_READ_TOOLS.contains(&tool_name) {
        summarize_file_read(tool_name, result, limits)
    } else if SHELL_TOOLS.contains(&tool_name) {
        summarize_shell(tool_name, result, limits)
    } else if SEARCH_TOOLS.contains(&tool_name) {
        summarize_search(tool_name, result)
    } else {
        summarize_generic(tool_name, result, limits)
    };

    cap_summary(summary, limits.max_summary_len)
}

fn summarize_file_read(tool_name: &str, result: &Value, limits: &SummaryLimits) -> String {
    let Some(map) = result.as_object() else {
        return format!("Tool {tool_name} produced an unexpected result structure.");
    };

    if map.get("status").and_then(Value::as_str) == Some("error") {
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        return format!("Error reading file: {message}");
    }

    match map.get("content") {
        Some(Value::String(content)) => {
            let label = if CODE_KEYWORDS.iter().any(|keyword| content.contains(keyword)) {
                "Read code file."
            } else {
                "Read file."
            };
            let window = limits.file_window;
            let head = truncate_chars(content, window);
            let tail = if content.chars().count() > window * 2 {
                last_chars(content, window)
            } else {
                String::new()
            };
            format!(
                "{label} Length: {} chars. Content (truncated): {head}...{tail}",
                content.len()
            )
        }
        Some(other) => format!("Read file, content type: {}.", value_type_name(other)),
        None => format!("Tool {tool_name} produced an unexpected result structure."),
    }
}

fn summarize_shell(tool_name: &str, result: &Value, limits: &SummaryLimits) -> String {
    let Some(map) = result.as_object() else {
        return format!(
            "Tool {tool_name} (shell command) produced non-dict result: {}",
            truncate_chars(&result.to_string(), 100)
        );
    };

    let command = map
        .get("command_executed")
        .or_else(|| map.get("command"))
        .and_then(Value::as_str)
        .unwrap_or("unknown_command");
    let return_code = map.get("return_code").and_then(Value::as_i64);

    let mut parts = vec![format!("Shell command '{command}'")];
    match return_code {
        Some(0) => parts.push("succeeded (rc=0).".to_string()),
        Some(code) => parts.push(format!("failed (rc={code}).")),
        None => parts.push("failed (rc=N/A).".to_string()),
    }

    let stream_window = limits.max_summary_len / 2;
    let stdout = map.get("stdout").and_then(Value::as_str).unwrap_or("");
    let stderr = map.get("stderr").and_then(Value::as_str).unwrap_or("");

    if !stdout.is_empty() {
        if stdout.contains("[Output truncated") {
            // The tool already trimmed the stream; keep what follows its marker.
            let rest = stdout.split_once('\n').map(|(_, rest)| rest).unwrap_or(stdout);
            parts.push(format!(
                "Stdout was large and truncated. First/last parts: {rest}"
            ));
        } else {
            parts.push(format!("Stdout: {}", truncate_chars(stdout, stream_window)));
        }
    }
    if !stderr.is_empty() {
        if stderr.contains("[Output truncated") {
            let rest = stderr.split_once('\n').map(|(_, rest)| rest).unwrap_or(stderr);
            parts.push(format!(
                "Stderr was large and truncated. First/last parts: {rest}"
            ));
        } else {
            parts.push(format!("Stderr: {}", truncate_chars(stderr, stream_window)));
        }
    }

    if stdout.is_empty() && stderr.is_empty() {
        if return_code == Some(0) {
            parts.push("No output on stdout or stderr.".to_string());
        } else {
            parts.push("No output on stdout or stderr, but command failed.".to_string());
        }
    }

    parts.join(" ")
}

fn summarize_search(tool_name: &str, result: &Value) -> String {
    let Some(map) = result.as_object() else {
        return format!("{tool_name} completed with non-dict result.");
    };

    if let Some(matches) = map.get("matches").and_then(Value::as_array) {
        return format!("Search returned {} matches.", matches.len());
    }
    if let Some(chunks) = map.get("retrieved_chunks").and_then(Value::as_array) {
        return format!("Retrieved {} code chunks.", chunks.len());
    }
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    format!("{tool_name} completed. Keys: {keys:?}")
}

fn summarize_generic(tool_name: &str, result: &Value, limits: &SummaryLimits) -> String {
    match result {
        Value::Object(map) => {
            let mut parts = Vec::new();
            for key in IMPORTANT_KEYS {
                let Some(value) = map.get(*key) else { continue };
                if value.is_null() {
                    continue;
                }
                let rendered = match value {
                    Value::String(text) if text.is_empty() => continue,
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let truncated = if rendered.chars().count() > limits.important_key {
                    format!("{}...", truncate_chars(&rendered, limits.important_key))
                } else {
                    rendered
                };
                parts.push(format!("{key}: {truncated}"));
            }
            if parts.is_empty() {
                format!(
                    "Tool {tool_name} completed. Result (truncated): {}...",
                    truncate_chars(&result.to_string(), limits.generic)
                )
            } else {
                format!("Tool {tool_name}: {}", parts.join("; "))
            }
        }
        Value::String(text) => format!(
            "Tool {tool_name} output (truncated): {}...",
            truncate_chars(text, limits.generic)
        ),
        other => format!(
            "Tool {tool_name} completed with result type: {}.",
            value_type_name(other)
        ),
    }
}

fn cap_summary(summary: String, max_len: usize) -> String {
    if summary.chars().count() <= max_len {
        return summary;
    }
    let keep = max_len.saturating_sub(TRUNCATION_SUFFIX.len());
    format!("{}{}", truncate_chars(&summary, keep), TRUNCATION_SUFFIX)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn last_chars(text: &str, count: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
