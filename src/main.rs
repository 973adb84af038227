//! opsmith - interactive AI coding and DevOps agent.
//!
//! Thin binary entry point: loads an agent manifest, wires the provider and
//! tool registry into the core runtime, and runs the interactive loop.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opsmith_core::agent::Agent;
use opsmith_core::rag::{IndexDirectoryTool, LocalCodeRetriever, RetrieveContextTool};
use opsmith_core::tools::file_ops::register_file_tools;
use opsmith_core::tools::registry::ToolRegistry;
use opsmith_core::tools::shell::ShellTool;

mod cli;
mod interactive;
mod manifest;
mod provider;
mod session;

use cli::{Cli, Commands};
use interactive::LoopOutcome;

/// Exit code reported after a user interrupt, mirroring shell convention.
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("opsmith=info,opsmith_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(LoopOutcome::Finished) => ExitCode::SUCCESS,
        Ok(LoopOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(error) => {
            eprintln!("Error: {error:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<LoopOutcome> {
    match cli.command {
        Commands::Run {
            agent_module,
            save_session,
            session_id,
            input_file,
            ui_theme,
            tui,
        } => {
            let loaded = manifest::load_agent(&agent_module)?;
            info!(
                module = %agent_module,
                workspace = %loaded.workspace_root.display(),
                theme = %ui_theme,
                tui,
                "loaded agent definition"
            );

            let provider_name = loaded.manifest.provider.as_deref().unwrap_or("echo");
            let llm_provider = provider::build_provider(provider_name)?;

            let mut registry = ToolRegistry::new();
            register_file_tools(&mut registry)
                .context("failed to register built-in file tools")?;
            registry
                .register(ShellTool::arc(loaded.manifest.config.tools.clone()))
                .context("failed to register the shell tool")?;
            let retriever: Arc<dyn opsmith_core::rag::CodeRetriever> =
                Arc::new(LocalCodeRetriever::new());
            registry
                .register(Arc::new(IndexDirectoryTool::new(Arc::clone(&retriever))))
                .context("failed to register the index tool")?;
            registry
                .register(Arc::new(RetrieveContextTool::new(retriever, 8)))
                .context("failed to register the retrieval tool")?;

            let mut builder = Agent::builder(
                loaded.manifest.config.clone(),
                llm_provider,
                Arc::new(registry),
                loaded.workspace_root.clone(),
            );
            if let Some(instruction) = &loaded.manifest.instruction {
                builder = builder.system_instruction(instruction.clone());
            }
            let mut agent = builder.build().await;

            if let Some(id) = &session_id {
                match session::load_session(id) {
                    Ok(snapshot) => {
                        agent
                            .restore_from_snapshot(&snapshot)
                            .context("failed to restore saved session")?;
                        info!(session = %id, "restored saved session");
                    }
                    Err(error) => {
                        info!(session = %id, %error, "no restorable session, starting fresh");
                    }
                }
            }

            let outcome = match input_file {
                Some(path) => interactive::run_batch(&mut agent, &path).await?,
                None => interactive::run_interactive(&mut agent).await?,
            };

            let stats = agent.telemetry().snapshot();
            info!(
                turns = stats.total_turns,
                llm_requests = stats.total_llm_requests,
                tool_calls = stats.total_tool_calls,
                retries = stats.total_retries,
                api_time_ms = stats.api_time_spent.as_millis() as u64,
                "session finished"
            );

            if save_session {
                let id = session_id.unwrap_or_else(session::default_session_id);
                let path = session::save_session(&id, &agent.snapshot())?;
                eprintln!("Session saved to {}", path.display());
            }

            Ok(outcome)
        }
    }
}
