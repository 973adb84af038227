//! Built-in file system tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::registry::{Tool, ToolContext, ToolError};

fn arg_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing required string argument '{key}'"),
        })
}

fn resolve(ctx: &ToolContext, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        ctx.workspace_root.join(candidate)
    }
}

/// Read a file's content.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file at the given path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path to the file to read"}
            },
            "required": ["file_path"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let file_path = arg_str(&args, "file_path", self.name())?;
        let resolved = resolve(ctx, file_path);
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => {
                ctx.state
                    .insert("last_read_file".into(), json!(file_path));
                Ok(json!({
                    "status": "success",
                    "file_path": file_path,
                    "content": content,
                }))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(
                ToolError::Execution(format!("File not found: {file_path}")),
            ),
            Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => Err(
                ToolError::Execution(format!("Permission denied: {file_path}")),
            ),
            Err(error) => Err(ToolError::Execution(format!(
                "Failed to read {file_path}: {error}"
            ))),
        }
    }
}

/// Write content to a file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it if it does not exist."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path to the file to write"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["file_path", "content"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let file_path = arg_str(&args, "file_path", self.name())?;
        let content = arg_str(&args, "content", self.name())?;
        let resolved = resolve(ctx, file_path);

        if let Some(parent) = resolved.parent() {
            if let Err(error) = tokio::fs::create_dir_all(parent).await {
                return Err(ToolError::Execution(format!(
                    "Failed to create parent directories for {file_path}: {error}"
                )));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(json!({
                "status": "success",
                "file_path": file_path,
                "bytes_written": content.len(),
            })),
            Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => Err(
                ToolError::Execution(format!("Permission denied: {file_path}")),
            ),
            Err(error) => Err(ToolError::Execution(format!(
                "Failed to write {file_path}: {error}"
            ))),
        }
    }
}

/// List directory entries.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list; defaults to the workspace root"}
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let resolved = resolve(ctx, path);

        let mut read_dir = match tokio::fs::read_dir(&resolved).await {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::Execution(format!("File not found: {path}")));
            }
            Err(error) => {
                return Err(ToolError::Execution(format!(
                    "Failed to list {path}: {error}"
                )));
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            entries.push(json!({"name": name, "is_dir": is_dir}));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(json!({"status": "success", "path": path, "entries": entries}))
    }
}

/// Register the built-in file tools.
pub fn register_file_tools(
    registry: &mut super::registry::ToolRegistry,
) -> Result<(), super::registry::RegistryError> {
    registry.register(Arc::new(ReadFileTool))?;
    registry.register(Arc::new(WriteFileTool))?;
    registry.register(Arc::new(ListDirTool))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::ToolRegistry;

    #[tokio::test]
    async fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        register_file_tools(&mut registry).unwrap();
        let mut ctx = ToolContext::new(dir.path());

        registry
            .invoke(
                "write_file",
                json!({"file_path": "notes/plan.txt", "content": "step one"}),
                &mut ctx,
            )
            .await
            .unwrap();

        let read = registry
            .invoke("read_file", json!({"file_path": "notes/plan.txt"}), &mut ctx)
            .await
            .unwrap();
        assert_eq!(read["status"], "success");
        assert_eq!(read["content"], "step one");
        assert_eq!(ctx.state["last_read_file"], "notes/plan.txt");
    }

    #[tokio::test]
    async fn missing_file_raises_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ToolContext::new(dir.path());
        let error = ReadFileTool
            .invoke(json!({"file_path": "ghost.txt"}), &mut ctx)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn list_dir_returns_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut ctx = ToolContext::new(dir.path());
        let result = ListDirTool.invoke(json!({}), &mut ctx).await.unwrap();
        let entries = result["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["name"], "a.txt");
        assert_eq!(entries[2]["is_dir"], true);
    }
}
