//! Proactive repository context gathering.
//!
//! Before the first assembly of a conversation, the gatherer collects a
//! lightweight picture of the workspace: notable project files, recent git
//! history, and documentation entry points. The result is an opaque JSON
//! mapping; the assembler decides how much of it fits the budget, category
//! by category.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Maximum project files listed.
const MAX_PROJECT_FILES: usize = 50;
/// Maximum documentation files listed.
const MAX_DOC_FILES: usize = 10;
/// Git log entries requested.
const GIT_LOG_COUNT: usize = 10;
/// Head of the primary README captured for context.
const README_HEAD_CHARS: usize = 1200;

/// Directories never worth scanning.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

/// Extensions that mark a file as project-relevant.
const PROJECT_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "go", "java", "rb", "sh", "toml", "yaml", "yml", "json", "tf",
    "dockerfile",
];

/// Gathers project files, git history, and documentation for a workspace.
#[derive(Debug, Clone)]
pub struct ProactiveGatherer {
    workspace_root: PathBuf,
}

impl ProactiveGatherer {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Gather every category. Categories that cannot be collected are
    /// omitted rather than failing the whole gathering pass.
    pub async fn gather_all(&self) -> Value {
        let mut context = serde_json::Map::new();

        let project_files = self.gather_project_files();
        if !project_files.is_empty() {
            context.insert("project_files".into(), json!(project_files));
        }

        if let Some(history) = self.gather_git_history().await {
            context.insert("git_history".into(), json!(history));
        }

        let documentation = self.gather_documentation().await;
        if !documentation.is_empty() {
            context.insert("documentation".into(), Value::Object(documentation));
        }

        debug!(
            categories = context.len(),
            "proactive context gathering finished"
        );
        Value::Object(context)
    }

    fn gather_project_files(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.workspace_root)
            .max_depth(4)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !SKIP_DIRS.contains(&name))
                    .unwrap_or(false)
            })
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                let extension = Path::new(&name)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("");
                PROJECT_EXTENSIONS.contains(&extension) || name == "dockerfile" || name == "makefile"
            })
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.workspace_root)
                    .ok()
                    .map(|path| path.to_string_lossy().into_owned())
            })
            .collect();
        files.sort();
        files.truncate(MAX_PROJECT_FILES);
        files
    }

    async fn gather_git_history(&self) -> Option<Vec<String>> {
        let output = Command::new("git")
            .arg("log")
            .arg("--oneline")
            .arg(format!("-{GIT_LOG_COUNT}"))
            .current_dir(&self.workspace_root)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let log = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<String> = log.lines().map(str::to_owned).collect();
        if lines.is_empty() { None } else { Some(lines) }
    }

    async fn gather_documentation(&self) -> serde_json::Map<String, Value> {
        let mut documentation = serde_json::Map::new();

        let mut doc_files: Vec<String> = WalkDir::new(&self.workspace_root)
            .max_depth(3)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !SKIP_DIRS.contains(&name))
                    .unwrap_or(false)
            })
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
            })
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.workspace_root)
                    .ok()
                    .map(|path| path.to_string_lossy().into_owned())
            })
            .collect();
        doc_files.sort();
        doc_files.truncate(MAX_DOC_FILES);

        for candidate in ["README.md", "readme.md"] {
            let path = self.workspace_root.join(candidate);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                let head: String = content.chars().take(README_HEAD_CHARS).collect();
                documentation.insert("readme_head".into(), Value::String(head));
                break;
            }
        }

        if !doc_files.is_empty() {
            documentation.insert("doc_files".into(), json!(doc_files));
        }
        documentation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn gathers_project_files_and_readme() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("README.md"), "# Demo\nA demo project.").unwrap();
        fs::write(dir.path().join("notes.txt"), "not project relevant").unwrap();

        let gatherer = ProactiveGatherer::new(dir.path());
        let context = gatherer.gather_all().await;

        let files = context["project_files"].as_array().unwrap();
        assert!(files.iter().any(|f| f.as_str() == Some("src/main.rs")));
        assert!(!files.iter().any(|f| f.as_str() == Some("notes.txt")));
        let readme = context["documentation"]["readme_head"].as_str().unwrap();
        assert!(readme.starts_with("# Demo"));
    }

    #[tokio::test]
    async fn missing_git_repo_omits_history() {
        let dir = tempfile::tempdir().unwrap();
        let gatherer = ProactiveGatherer::new(dir.path());
        let context = gatherer.gather_all().await;
        assert!(context.get("git_history").is_none());
    }
}
