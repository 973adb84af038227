//! Dependency-aware tool execution.
//!
//! The orchestrator runs tool invocations with optional dependencies on
//! earlier invocations in the same batch, sequential and parallel
//! sequencing helpers, and classified error recovery. A failed dependency
//! does not cancel dependents; they proceed and may fail on their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::context::ContextManager;

use super::recovery;
use super::registry::{ToolContext, ToolRegistry};

/// Poll interval while waiting on dependencies.
const DEPENDENCY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ToolExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolExecutionStatus::Completed
                | ToolExecutionStatus::Failed
                | ToolExecutionStatus::Cancelled
        )
    }
}

/// Record of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub execution_id: String,
    pub tool_name: String,
    pub args: Value,
    pub status: ToolExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: f64,
    pub dependencies: Vec<String>,
    pub retry_count: u32,
}

impl ToolExecution {
    fn new(execution_id: String, tool_name: &str, args: Value, dependencies: Vec<String>) -> Self {
        Self {
            execution_id,
            tool_name: tool_name.to_string(),
            args,
            status: ToolExecutionStatus::Pending,
            result: None,
            error: None,
            execution_time: 0.0,
            dependencies,
            retry_count: 0,
        }
    }
}

/// Executes tools with dependencies, parallelism, and recovery.
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    config: ToolsConfig,
    workspace_root: std::path::PathBuf,
    active: Arc<Mutex<HashMap<String, ToolExecutionStatus>>>,
    completed_count: Arc<Mutex<usize>>,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        config: ToolsConfig,
        workspace_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            registry,
            config,
            workspace_root: workspace_root.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
            completed_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool invocation with dependency waits and recovery.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        args: Value,
        dependencies: Vec<String>,
        execution_id: Option<String>,
    ) -> ToolExecution {
        let execution_id = match execution_id {
            Some(id) => id,
            None => {
                let count = *self.completed_count.lock().await;
                format!("{tool_name}_{count}")
            }
        };
        let mut execution =
            ToolExecution::new(execution_id.clone(), tool_name, args, dependencies);

        self.active
            .lock()
            .await
            .insert(execution_id.clone(), ToolExecutionStatus::Pending);

        self.wait_for_dependencies(&execution.dependencies).await;

        execution.status = ToolExecutionStatus::Running;
        self.active
            .lock()
            .await
            .insert(execution_id.clone(), ToolExecutionStatus::Running);
        let started = Instant::now();

        let mut ctx = ToolContext::new(&self.workspace_root);
        match self
            .registry
            .invoke(tool_name, execution.args.clone(), &mut ctx)
            .await
        {
            Ok(result) => {
                execution.result = Some(result);
                execution.status = ToolExecutionStatus::Completed;
            }
            Err(error) => {
                let message = error.to_string();
                warn!(tool = tool_name, %message, "tool invocation failed");
                execution.status = ToolExecutionStatus::Failed;
                execution.error = Some(message.clone());

                if execution.retry_count < self.config.max_retries {
                    let class = recovery::classify_error(&message);
                    if let Some(recovered) = recovery::attempt_recovery(
                        &self.registry,
                        &mut execution,
                        class,
                        self.config.max_retries,
                        &mut ctx,
                    )
                    .await
                    {
                        execution.result = Some(recovered);
                        execution.status = ToolExecutionStatus::Completed;
                        execution.error = None;
                    }
                }
            }
        }
        execution.execution_time = started.elapsed().as_secs_f64();

        // An id absent from the active set reads as terminal, so finished
        // executions are simply removed.
        self.active.lock().await.remove(&execution_id);
        *self.completed_count.lock().await += 1;

        debug!(
            id = %execution.execution_id,
            status = ?execution.status,
            time = execution.execution_time,
            retries = execution.retry_count,
            "tool execution finished"
        );
        execution
    }

    /// Execute invocations in order; each depends on all prior items.
    pub async fn execute_sequence(&self, sequence: Vec<(String, Value)>) -> Vec<ToolExecution> {
        let mut results = Vec::with_capacity(sequence.len());
        for (index, (tool_name, args)) in sequence.iter().enumerate() {
            let dependencies: Vec<String> = sequence
                .iter()
                .take(index)
                .enumerate()
                .map(|(j, (name, _))| format!("{name}_{j}"))
                .collect();
            let execution = self
                .execute_tool(
                    tool_name,
                    args.clone(),
                    dependencies,
                    Some(format!("{tool_name}_{index}")),
                )
                .await;
            results.push(execution);
        }
        results
    }

    /// Execute invocations concurrently with no inter-item dependencies.
    /// Results preserve submission order, not completion order.
    pub async fn execute_parallel(self: &Arc<Self>, batch: Vec<(String, Value)>) -> Vec<ToolExecution> {
        let mut handles = Vec::with_capacity(batch.len());
        for (index, (tool_name, args)) in batch.into_iter().enumerate() {
            let orchestrator = Arc::clone(self);
            let execution_id = format!("{tool_name}_{index}");
            handles.push(tokio::spawn(async move {
                orchestrator
                    .execute_tool(&tool_name, args, Vec::new(), Some(execution_id))
                    .await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(execution) => results.push(execution),
                Err(join_error) => {
                    warn!(%join_error, "parallel tool task failed to join");
                }
            }
        }
        results
    }

    /// Poll the active set until every dependency reaches a terminal state.
    /// An id absent from the active set counts as already completed.
    pub async fn wait_for_dependencies(&self, dependencies: &[String]) {
        let mut remaining: Vec<String> = dependencies.to_vec();
        while !remaining.is_empty() {
            {
                let active = self.active.lock().await;
                remaining.retain(|id| {
                    active
                        .get(id)
                        .map(|status| !status.is_terminal())
                        .unwrap_or(false)
                });
            }
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(DEPENDENCY_POLL).await;
        }
    }

    /// Record a batch of executions into the context manager, in the order
    /// their invocations started.
    pub async fn record_results(context: &mut ContextManager, executions: &[ToolExecution]) {
        for execution in executions {
            let value = match (&execution.result, &execution.error) {
                (Some(result), _) => result.clone(),
                (None, Some(error)) => {
                    serde_json::json!({"status": "error", "message": error})
                }
                (None, None) => serde_json::json!({"status": "error", "message": "no result"}),
            };
            context
                .add_tool_result(&execution.tool_name, value, None)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::file_ops::register_file_tools;
    use crate::tools::shell::ShellTool;
    use serde_json::json;

    fn orchestrator_in(dir: &std::path::Path) -> Arc<ToolOrchestrator> {
        let mut registry = ToolRegistry::new();
        register_file_tools(&mut registry).unwrap();
        registry
            .register(ShellTool::arc(ToolsConfig {
                require_shell_approval: false,
                ..ToolsConfig::default()
            }))
            .unwrap();
        Arc::new(ToolOrchestrator::new(
            Arc::new(registry),
            ToolsConfig::default(),
            dir,
        ))
    }

    #[tokio::test]
    async fn sequence_executes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let results = orchestrator
            .execute_sequence(vec![
                (
                    "write_file".to_string(),
                    json!({"file_path": "a.txt", "content": "first"}),
                ),
                ("read_file".to_string(), json!({"file_path": "a.txt"})),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.status == ToolExecutionStatus::Completed));
        assert_eq!(
            results[1].result.as_ref().unwrap()["content"],
            "first"
        );
    }

    #[tokio::test]
    async fn parallel_preserves_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "x").unwrap();
        std::fs::write(dir.path().join("y.txt"), "y").unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let results = orchestrator
            .execute_parallel(vec![
                ("read_file".to_string(), json!({"file_path": "x.txt"})),
                ("read_file".to_string(), json!({"file_path": "y.txt"})),
                ("list_dir".to_string(), json!({})),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].result.as_ref().unwrap()["content"], "x");
        assert_eq!(results[1].result.as_ref().unwrap()["content"], "y");
        assert_eq!(results[2].tool_name, "list_dir");
    }

    #[tokio::test]
    async fn missing_file_recovers_through_backup_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml.backup"), "backup data").unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let execution = orchestrator
            .execute_tool(
                "read_file",
                json!({"file_path": "config.toml"}),
                Vec::new(),
                None,
            )
            .await;

        assert_eq!(execution.status, ToolExecutionStatus::Completed);
        assert!(execution.retry_count >= 1 && execution.retry_count <= 3);
        assert_eq!(
            execution.result.as_ref().unwrap()["content"],
            "backup data"
        );
    }

    #[tokio::test]
    async fn unrecoverable_failure_reports_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let execution = orchestrator
            .execute_tool(
                "read_file",
                json!({"file_path": "missing.txt"}),
                Vec::new(),
                None,
            )
            .await;

        assert_eq!(execution.status, ToolExecutionStatus::Failed);
        assert!(execution.error.as_ref().unwrap().contains("File not found"));
    }

    #[tokio::test]
    async fn failed_dependency_does_not_cancel_dependent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "here").unwrap();
        let orchestrator = orchestrator_in(dir.path());

        let results = orchestrator
            .execute_sequence(vec![
                ("read_file".to_string(), json!({"file_path": "absent.txt"})),
                ("read_file".to_string(), json!({"file_path": "present.txt"})),
            ])
            .await;

        assert_eq!(results[0].status, ToolExecutionStatus::Failed);
        assert_eq!(results[1].status, ToolExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn results_are_recorded_into_context() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let mut context = ContextManager::new(
            crate::config::ContextConfig {
                enable_proactive_context: false,
                ..crate::config::ContextConfig::default()
            },
            crate::core::token_counter::TokenCounter::heuristic("test-model"),
        );
        context.start_new_turn(Some("read the file")).await;

        let execution = orchestrator
            .execute_tool(
                "read_file",
                json!({"file_path": "missing.txt"}),
                Vec::new(),
                None,
            )
            .await;
        ToolOrchestrator::record_results(&mut context, &[execution]).await;

        assert_eq!(context.tool_result_count(), 1);
    }
}
