use clap::{Parser, Subcommand};

/// opsmith - an interactive AI coding and DevOps agent.
#[derive(Debug, Parser)]
#[command(name = "opsmith", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load an agent definition and enter an interactive session.
    Run {
        /// Agent module to load: a directory containing `agent.toml`, or a
        /// path to the manifest itself.
        agent_module: String,

        /// Persist the conversation state to the session directory on exit.
        #[arg(long)]
        save_session: bool,

        /// Session identifier used for the saved session file.
        #[arg(long)]
        session_id: Option<String>,

        /// Read user messages from a file instead of stdin.
        #[arg(long)]
        input_file: Option<String>,

        /// UI theme name (plain output honors it by omission).
        #[arg(long, default_value = "default")]
        ui_theme: String,

        /// Render with the full-screen terminal UI instead of line output.
        #[arg(long)]
        tui: bool,
    },
}
