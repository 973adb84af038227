//! Trait-driven tool registry.
//!
//! Tools are heterogeneous capabilities registered by name. Results are
//! JSON values; a tool signals an expected failure by returning
//! `{"status": "error", ...}` and reserves `Err` for catastrophic failures
//! that the orchestrator may classify and recover from.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::llm::ToolDefinition;

/// Raised (not returned) tool failure. The orchestrator classifies the
/// rendered message for recovery.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("{0}")]
    Execution(String),
}

/// Mutable shared state scoped to a single invocation chain.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub state: Map<String, Value>,
}

impl ToolContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            state: Map::new(),
        }
    }
}

/// A capability callable by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the argument object.
    fn parameters(&self) -> Value;

    async fn invoke(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError>;
}

/// Registration-time validation failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
    #[error(
        "tool '{tool}' declares parameter '{parameter}' with a leading underscore, which the \
         function-calling schema generator rejects"
    )]
    UnderscoreParameter { tool: String, parameter: String },
}

/// Mapping from name to tool, preserving registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, validating its argument schema. No parameter name
    /// may begin with an underscore.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        if let Some(parameter) = find_underscore_parameter(&tool.parameters()) {
            return Err(RegistryError::UnderscoreParameter {
                tool: name,
                parameter,
            });
        }
        debug!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Schemas advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Invoke a tool by name.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &mut ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.invoke(args, ctx).await
    }
}

/// Depth-first search of a JSON schema for a property name starting with
/// `_`.
fn find_underscore_parameter(schema: &Value) -> Option<String> {
    let map = schema.as_object()?;
    if let Some(properties) = map.get("properties").and_then(Value::as_object) {
        for (name, nested) in properties {
            if name.starts_with('_') {
                return Some(name.clone());
            }
            if let Some(found) = find_underscore_parameter(nested) {
                return Some(found);
            }
        }
    }
    if let Some(items) = map.get("items") {
        if let Some(found) = find_underscore_parameter(items) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool {
        params: Value,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its arguments"
        }

        fn parameters(&self) -> Value {
            self.params.clone()
        }

        async fn invoke(&self, args: Value, _ctx: &mut ToolContext) -> Result<Value, ToolError> {
            Ok(json!({"status": "success", "echo": args}))
        }
    }

    #[tokio::test]
    async fn registered_tool_is_invokable() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(EchoTool {
                params: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            }))
            .unwrap();

        let mut ctx = ToolContext::new("/tmp");
        let result = registry
            .invoke("echo", json!({"text": "hi"}), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result["echo"]["text"], "hi");
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn underscore_parameters_are_rejected() {
        let mut registry = ToolRegistry::new();
        let error = registry
            .register(Arc::new(EchoTool {
                params: json!({"type": "object", "properties": {"_hidden": {"type": "string"}}}),
            }))
            .unwrap_err();
        assert!(matches!(error, RegistryError::UnderscoreParameter { .. }));
    }

    #[test]
    fn nested_underscore_parameters_are_rejected() {
        let mut registry = ToolRegistry::new();
        let error = registry
            .register(Arc::new(EchoTool {
                params: json!({
                    "type": "object",
                    "properties": {
                        "options": {
                            "type": "object",
                            "properties": {"_internal": {"type": "boolean"}}
                        }
                    }
                }),
            }))
            .unwrap_err();
        assert!(matches!(error, RegistryError::UnderscoreParameter { .. }));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let mut ctx = ToolContext::new("/tmp");
        let error = registry
            .invoke("missing", json!({}), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(error, ToolError::UnknownTool(_)));
    }
}
