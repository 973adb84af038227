//! Agent manifest loading.
//!
//! `opsmith run <agent-module>` resolves the module to an `agent.toml`
//! manifest, loads its environment file, and produces the configuration the
//! runtime is built from.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;

use opsmith_core::config::AgentConfig;

/// Top-level manifest: the agent section plus the core configuration
/// sections, all optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AgentManifest {
    /// System instruction handed to the model on every request.
    pub instruction: Option<String>,
    /// Transport name resolved by the provider factory.
    pub provider: Option<String>,
    /// Environment file loaded before the provider is constructed.
    pub env_file: Option<String>,
    /// Workspace the agent operates in; defaults to the manifest directory.
    pub workspace_root: Option<String>,
    /// Core configuration, flattened into [`AgentConfig`].
    #[serde(flatten)]
    pub config: AgentConfig,
}

#[derive(Debug)]
pub struct LoadedAgent {
    pub manifest: AgentManifest,
    pub workspace_root: PathBuf,
}

/// Resolve `agent_module` to a manifest path: the file itself, or
/// `<module>/agent.toml`.
fn resolve_manifest_path(agent_module: &str) -> Result<PathBuf> {
    let direct = Path::new(agent_module);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }
    let nested = direct.join("agent.toml");
    if nested.is_file() {
        return Ok(nested);
    }
    bail!(
        "agent module '{agent_module}' not found: expected a manifest file or a directory \
         containing agent.toml"
    );
}

/// Load an agent definition and its environment.
pub fn load_agent(agent_module: &str) -> Result<LoadedAgent> {
    let manifest_path = resolve_manifest_path(agent_module)?;
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: AgentManifest = toml::from_str(&raw)
        .with_context(|| format!("invalid agent manifest {}", manifest_path.display()))?;

    let manifest_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Some(env_file) = &manifest.env_file {
        let env_path = manifest_dir.join(env_file);
        if env_path.is_file() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("failed to load {}", env_path.display()))?;
            tracing::info!(path = %env_path.display(), "loaded agent environment");
        } else {
            tracing::warn!(path = %env_path.display(), "agent env_file not found, skipping");
        }
    }

    let workspace_root = manifest
        .workspace_root
        .as_ref()
        .map(|root| manifest_dir.join(root))
        .unwrap_or(manifest_dir);

    Ok(LoadedAgent {
        manifest,
        workspace_root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_manifest_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("agent.toml"),
            r#"
            instruction = "you are a test agent"

            [agent]
            model = "test-model"

            [context]
            max_llm_token_limit = 9000
            "#,
        )
        .unwrap();

        let loaded = load_agent(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(
            loaded.manifest.instruction.as_deref(),
            Some("you are a test agent")
        );
        assert_eq!(loaded.manifest.config.agent.model, "test-model");
        assert_eq!(loaded.manifest.config.context.max_llm_token_limit, 9000);
        assert_eq!(loaded.workspace_root, dir.path());
    }

    #[test]
    fn missing_module_is_an_error() {
        let error = load_agent("/nonexistent/agent/module").unwrap_err();
        assert!(error.to_string().contains("not found"));
    }
}
