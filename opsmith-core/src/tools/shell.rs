//! Vetted shell command execution.
//!
//! Commands run through a ladder of parsing strategies: a shell lexer
//! split, a single shell string, and a plain whitespace split. Each
//! strategy has its own failure handling; only after all three fail is the
//! invocation reported as failed. A configurable allow-list gates which
//! commands may run without approval.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ToolsConfig;

use super::registry::{Tool, ToolContext, ToolError};

/// Streams longer than this are trimmed with an explicit marker.
const MAX_STREAM_CHARS: usize = 10_000;

const TRUNCATION_MARKER: &str = "[Output truncated]";

/// Executes shell commands with strategy fallback and an allow-list.
pub struct ShellTool {
    config: ToolsConfig,
}

impl ShellTool {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    pub fn arc(config: ToolsConfig) -> Arc<dyn Tool> {
        Arc::new(Self::new(config))
    }

    /// A command is safe when its program is on the allow-list.
    fn is_safe_command(&self, command: &str) -> bool {
        let program = command
            .trim_start()
            .strip_prefix("sudo ")
            .unwrap_or(command.trim_start());
        let program = program.split_whitespace().next().unwrap_or("");
        self.config
            .default_safe_commands
            .iter()
            .any(|safe| safe == program)
    }

    async fn run_parsed(
        &self,
        program: &str,
        args: &[String],
        ctx: &ToolContext,
        timeout: Duration,
    ) -> std::io::Result<Option<std::process::Output>> {
        let child = Command::new(program)
            .args(args)
            .current_dir(&ctx.workspace_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn run_shell_string(
        &self,
        command: &str,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> std::io::Result<Option<std::process::Output>> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Execute a vetted shell command in the workspace and capture its output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "timeout": {
                    "type": "number",
                    "description": "Timeout in seconds; defaults to the configured tool timeout"
                }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: self.name().to_string(),
                message: "missing required string argument 'command'".to_string(),
            })?;
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_f64)
            .unwrap_or(self.config.default_timeout_secs as f64);
        let timeout = Duration::from_secs_f64(timeout_secs.max(0.1));

        if self.config.require_shell_approval && !self.is_safe_command(command) {
            return Ok(json!({
                "status": "error",
                "message": format!(
                    "Command '{command}' is not on the safe command list and requires approval."
                ),
                "command_executed": command,
            }));
        }

        ctx.state.insert("last_command".into(), json!(command));

        let mut last_error: Option<String> = None;
        let mut timed_out = false;

        // Strategy 1: shell lexer split.
        match shell_words::split(command) {
            Ok(parts) if !parts.is_empty() => {
                match self
                    .run_parsed(&parts[0], &parts[1..], ctx, timeout)
                    .await
                {
                    Ok(Some(output)) => {
                        return Ok(render_output(command, &output, "shlex_split"));
                    }
                    Ok(None) => timed_out = true,
                    Err(error) => {
                        debug!(%error, "lexer-split execution failed, trying shell string");
                        last_error = Some(error.to_string());
                    }
                }
            }
            Ok(_) => last_error = Some("empty command".to_string()),
            Err(error) => {
                // Unbalanced quoting lands here; the shell itself may still
                // accept the command.
                debug!(%error, "shell lexer failed, trying shell string");
                last_error = Some(error.to_string());
            }
        }

        // Strategy 2: hand the whole string to the shell.
        if !timed_out {
            match self.run_shell_string(command, ctx, timeout).await {
                Ok(Some(output)) => return Ok(render_output(command, &output, "shell_true")),
                Ok(None) => timed_out = true,
                Err(error) => {
                    debug!(%error, "shell-string execution failed, trying simple split");
                    last_error = Some(error.to_string());
                }
            }
        }

        // Strategy 3: plain whitespace split.
        if !timed_out {
            let parts: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
            if let Some((program, rest)) = parts.split_first() {
                match self.run_parsed(program, rest, ctx, timeout).await {
                    Ok(Some(output)) => {
                        return Ok(render_output(command, &output, "simple_split"));
                    }
                    Ok(None) => timed_out = true,
                    Err(error) => last_error = Some(error.to_string()),
                }
            }
        }

        if timed_out {
            warn!(command, timeout_secs, "shell command timed out");
            return Err(ToolError::Execution(format!(
                "Command timeout after {timeout_secs}s: {command}"
            )));
        }

        Err(ToolError::Execution(format!(
            "Command failed: {command}: {}",
            last_error.unwrap_or_else(|| "no strategy succeeded".to_string())
        )))
    }
}

fn render_output(command: &str, output: &std::process::Output, strategy: &str) -> Value {
    let return_code = output.status.code().unwrap_or(-1);
    json!({
        "status": if return_code == 0 { "success" } else { "error" },
        "command_executed": command,
        "return_code": return_code,
        "stdout": clip_stream(&String::from_utf8_lossy(&output.stdout)),
        "stderr": clip_stream(&String::from_utf8_lossy(&output.stderr)),
        "strategy_used": strategy,
    })
}

fn clip_stream(stream: &str) -> String {
    if stream.chars().count() <= MAX_STREAM_CHARS {
        return stream.to_string();
    }
    let clipped: String = stream.chars().take(MAX_STREAM_CHARS).collect();
    format!("{TRUNCATION_MARKER}\n{clipped}")
}
