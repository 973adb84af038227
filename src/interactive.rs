//! Interactive session loop.
//!
//! Reads user messages (stdin or an input file), drives the agent's event
//! stream, and renders events as plain lines. The `--tui` flag currently
//! maps to the same line renderer; a richer terminal UI plugs in here.

use anyhow::Result;
use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::info;

use opsmith_core::agent::{Agent, AgentEvent};

/// Outcome of the interactive loop, mapped to the process exit code.
pub enum LoopOutcome {
    Finished,
    Interrupted,
}

fn render_event(event: &AgentEvent) {
    match event {
        AgentEvent::TurnStarted { turn_number } => {
            info!(turn = turn_number, "turn started");
        }
        AgentEvent::AgentText { text } => println!("{text}"),
        AgentEvent::Thought { text } => println!("(thinking) {text}"),
        AgentEvent::PlanPresented { text } => println!("{text}"),
        AgentEvent::ToolCallStarted { tool_name, .. } => {
            println!("[tool] running {tool_name}...");
        }
        AgentEvent::ToolCallCompleted {
            tool_name,
            is_error,
        } => {
            if *is_error {
                println!("[tool] {tool_name} failed");
            } else {
                println!("[tool] {tool_name} finished");
            }
        }
        AgentEvent::Usage { usage } => {
            info!(
                prompt = usage.prompt_token_count,
                completion = usage.candidates_token_count,
                total = usage.total_token_count,
                "model usage"
            );
        }
        AgentEvent::Retrying {
            attempt,
            delay_secs,
            error,
        } => {
            println!("[retry] attempt {attempt} failed ({error}); retrying in {delay_secs:.1}s");
        }
        AgentEvent::Error { message } => println!("[error] {message}"),
        AgentEvent::TurnCompleted { .. } => {}
    }
}

/// Drive one turn to completion. Ctrl-C requests cooperative cancellation:
/// the stream is polled until the loop has recorded results and completed
/// the turn.
async fn run_one_message(agent: &mut Agent, message: String) {
    let cancel = agent.reset_cancellation();
    let mut events = std::pin::pin!(agent.run_turn(message));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("\n[cancelling...]");
                cancel.cancel();
            }
            event = events.next() => match event {
                Some(event) => render_event(&event),
                None => break,
            }
        }
    }
}

/// Feed messages from a file, one per non-empty line.
pub async fn run_batch(agent: &mut Agent, input_file: &str) -> Result<LoopOutcome> {
    let content = tokio::fs::read_to_string(input_file).await?;
    for line in content.lines() {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        println!("> {message}");
        run_one_message(agent, message.to_string()).await;
    }
    Ok(LoopOutcome::Finished)
}

/// Interactive stdin loop. Ctrl-C during a turn cancels that turn; Ctrl-C
/// at the prompt ends the session.
pub async fn run_interactive(agent: &mut Agent) -> Result<LoopOutcome> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        eprint!("opsmith> ");
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                return Ok(LoopOutcome::Interrupted);
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(LoopOutcome::Finished);
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "exit" || message == "quit" {
            return Ok(LoopOutcome::Finished);
        }

        run_one_message(agent, message.to_string()).await;
    }
}
