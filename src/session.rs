//! Session persistence for the CLI.
//!
//! `--save-session` writes the conversation's legacy-state snapshot as a
//! timestamped JSON document under the user data directory, keyed by
//! session id. Sessions are a host-side convenience; the core itself has no
//! persistence contract.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::json;

use opsmith_core::core::state::LegacyState;

fn sessions_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine the user data directory")?;
    Ok(base.join("opsmith").join("sessions"))
}

/// Persist a snapshot and return the file path.
pub fn save_session(session_id: &str, snapshot: &LegacyState) -> Result<PathBuf> {
    let dir = sessions_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let document = json!({
        "session_id": session_id,
        "saved_at": Utc::now().to_rfc3339(),
        "state": snapshot,
    });
    let path = dir.join(format!("{session_id}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&document)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Load a previously saved snapshot.
pub fn load_session(session_id: &str) -> Result<LegacyState> {
    let path = sessions_dir()?.join(format!("{session_id}.json"));
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let document: serde_json::Value = serde_json::from_str(&raw)?;
    document
        .get("state")
        .and_then(|state| state.as_object())
        .cloned()
        .with_context(|| format!("{} does not contain a state object", path.display()))
}

/// Generate a session id from the current time when none was given.
pub fn default_session_id() -> String {
    Utc::now().format("session-%Y%m%d-%H%M%S").to_string()
}
