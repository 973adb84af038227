//! Classified error recovery for tool invocations.
//!
//! A raised tool error is classified from its message text; each class has
//! a deterministic recovery strategy with a bounded attempt budget. A
//! successful recovery replaces the failed result; exhaustion leaves the
//! invocation failed with its last error.

use serde_json::{Value, json};
use tracing::{debug, info};

use super::orchestrator::ToolExecution;
use super::registry::{ToolContext, ToolRegistry};

/// Error classes with dedicated recovery strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    FileNotFound,
    PermissionDenied,
    CommandFailed,
    Timeout,
    ResourceExhausted,
    Unknown,
}

/// Command substitutions tried for `command_failed` shell errors.
const COMMAND_SUBSTITUTIONS: &[(&str, &str)] = &[("npm install", "yarn install")];

/// Default timeout seeded when a timed-out invocation had none.
const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Classify an error message into a recovery class.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("file not found") || lower.contains("no such file") {
        ErrorClass::FileNotFound
    } else if lower.contains("permission denied") {
        ErrorClass::PermissionDenied
    } else if lower.contains("command failed") || lower.contains("exit code") {
        ErrorClass::CommandFailed
    } else if lower.contains("timeout") {
        ErrorClass::Timeout
    } else if lower.contains("resource exhausted") || lower.contains("quota") {
        ErrorClass::ResourceExhausted
    } else {
        ErrorClass::Unknown
    }
}

/// Deterministic alternative paths for a missing file, tried in order.
pub fn alternative_paths(path: &str) -> Vec<String> {
    vec![
        path.replace("/src/", "/lib/"),
        path.replace(".py", ".pyi"),
        format!("{path}.backup"),
    ]
}

/// Attempt recovery for a failed execution. Each attempt increments
/// `retry_count`; the budget is `max_retries` attempts total.
pub async fn attempt_recovery(
    registry: &ToolRegistry,
    execution: &mut ToolExecution,
    class: ErrorClass,
    max_retries: u32,
    ctx: &mut ToolContext,
) -> Option<Value> {
    match class {
        ErrorClass::FileNotFound => {
            if execution.tool_name != "read_file" {
                return None;
            }
            let path = execution
                .args
                .get("file_path")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            for alternative in alternative_paths(&path) {
                if alternative == path {
                    continue;
                }
                if execution.retry_count >= max_retries {
                    break;
                }
                execution.retry_count += 1;
                debug!(original = %path, alternative = %alternative, "trying alternative path");
                if let Ok(result) = registry
                    .invoke("read_file", json!({"file_path": alternative}), ctx)
                    .await
                {
                    info!(alternative = %alternative, "alternative path recovery succeeded");
                    return Some(result);
                }
            }
            None
        }
        ErrorClass::PermissionDenied => {
            if execution.tool_name != "execute_shell" || execution.retry_count >= max_retries {
                return None;
            }
            let command = execution
                .args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if command.starts_with("sudo ") {
                return None;
            }
            execution.retry_count += 1;
            set_arg(execution, "command", json!(format!("sudo {command}")));
            registry
                .invoke("execute_shell", execution.args.clone(), ctx)
                .await
                .ok()
        }
        ErrorClass::CommandFailed => {
            if execution.tool_name != "execute_shell" || execution.retry_count >= max_retries {
                return None;
            }
            let command = execution
                .args
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let substituted = COMMAND_SUBSTITUTIONS
                .iter()
                .find(|(from, _)| command.contains(from))
                .map(|(from, to)| command.replace(from, to))?;
            execution.retry_count += 1;
            info!(from = %command, to = %substituted, "substituting failed command");
            set_arg(execution, "command", json!(substituted));
            registry
                .invoke("execute_shell", execution.args.clone(), ctx)
                .await
                .ok()
        }
        ErrorClass::Timeout => {
            while execution.retry_count < max_retries {
                execution.retry_count += 1;
                let doubled = execution
                    .args
                    .get("timeout")
                    .and_then(Value::as_f64)
                    .map(|current| current * 2.0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS);
                set_arg(execution, "timeout", json!(doubled));
                debug!(timeout = doubled, "retrying with doubled timeout");
                match registry
                    .invoke(&execution.tool_name, execution.args.clone(), ctx)
                    .await
                {
                    Ok(result) => return Some(result),
                    Err(error) if classify_error(&error.to_string()) == ErrorClass::Timeout => {
                        continue;
                    }
                    Err(_) => break,
                }
            }
            None
        }
        ErrorClass::ResourceExhausted => {
            while execution.retry_count < max_retries {
                execution.retry_count += 1;
                let delay = 2u64.saturating_pow(execution.retry_count);
                debug!(delay, "backing off after resource exhaustion");
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                match registry
                    .invoke(&execution.tool_name, execution.args.clone(), ctx)
                    .await
                {
                    Ok(result) => return Some(result),
                    Err(error)
                        if classify_error(&error.to_string()) == ErrorClass::ResourceExhausted =>
                    {
                        continue;
                    }
                    Err(_) => break,
                }
            }
            None
        }
        ErrorClass::Unknown => None,
    }
}

fn set_arg(execution: &mut ToolExecution, key: &str, value: Value) {
    if let Some(map) = execution.args.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases: &[(&str, ErrorClass)] = &[
            ("File not found: /src/auth.py", ErrorClass::FileNotFound),
            ("no such file or directory", ErrorClass::FileNotFound),
            ("Permission denied: /etc/shadow", ErrorClass::PermissionDenied),
            ("Command failed: npm install", ErrorClass::CommandFailed),
            ("process exited with exit code 1", ErrorClass::CommandFailed),
            ("Command timeout after 60s", ErrorClass::Timeout),
            ("resource exhausted: too many requests", ErrorClass::ResourceExhausted),
            ("quota exceeded for project", ErrorClass::ResourceExhausted),
            ("mysterious failure", ErrorClass::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_error(message), *expected, "case: {message}");
        }
    }

    #[test]
    fn alternative_paths_are_deterministic_and_ordered() {
        let alternatives = alternative_paths("/src/auth.py");
        assert_eq!(
            alternatives,
            vec![
                "/lib/auth.py".to_string(),
                "/src/auth.pyi".to_string(),
                "/src/auth.py.backup".to_string(),
            ]
        );
    }
}
