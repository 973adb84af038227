//! Retrieval-augmented context collaborator interface.
//!
//! The embedding store and retriever live outside the core; this module
//! defines the narrow contract the core consumes, tool adapters that expose
//! retrieval to the model, and the fixed-escalation retry used around
//! embedding batches. Failures surface to the run loop as classified
//! errors.

pub mod local;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::tools::registry::{Tool, ToolContext, ToolError};

pub use local::LocalCodeRetriever;

/// Fixed escalating sleeps between embedding-batch retries.
pub const EMBEDDING_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(240),
];

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("indexing failed: {0}")]
    Indexing(String),
    #[error("retrieval failed: {0}")]
    Retrieval(String),
    #[error("embedding batch failed: {0}")]
    Embedding(String),
}

/// Location metadata for one retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_path: String,
    pub chunk_name: String,
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub metadata: ChunkMetadata,
    pub document: String,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub query: String,
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub directory: String,
    pub indexed_files: usize,
    pub chunks: usize,
}

/// Contract consumed by the core for code retrieval.
#[async_trait]
pub trait CodeRetriever: Send + Sync {
    async fn index_directory(
        &self,
        path: &Path,
        extensions: Option<&[String]>,
        force_reindex: bool,
    ) -> Result<IndexSummary, RagError>;

    async fn retrieve_code_context(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<RetrievedContext, RagError>;
}

/// Run an embedding-dependent operation with the fixed escalating retry.
/// Only embedding-class failures retry; indexing and retrieval errors
/// surface immediately.
pub async fn with_embedding_retry<T, F, Fut>(mut operation: F) -> Result<T, RagError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RagError>>,
{
    retry_with_delays(&mut operation, &EMBEDDING_RETRY_DELAYS).await
}

async fn retry_with_delays<T, F, Fut>(operation: &mut F, delays: &[Duration]) -> Result<T, RagError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RagError>>,
{
    let mut last_error = None;
    for (attempt, delay) in std::iter::once(None)
        .chain(delays.iter().map(Some))
        .enumerate()
    {
        if let Some(delay) = delay {
            warn!(attempt, delay_secs = delay.as_secs(), "embedding batch retry");
            tokio::time::sleep(*delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(RagError::Embedding(message)) => {
                last_error = Some(RagError::Embedding(message));
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_error.unwrap_or_else(|| RagError::Embedding("exhausted retries".to_string())))
}

/// Tool adapter for `index_directory`.
pub struct IndexDirectoryTool {
    retriever: Arc<dyn CodeRetriever>,
}

impl IndexDirectoryTool {
    pub fn new(retriever: Arc<dyn CodeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for IndexDirectoryTool {
    fn name(&self) -> &str {
        "index_directory"
    }

    fn description(&self) -> &str {
        "Index a directory of source code for semantic retrieval."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to index"},
                "extensions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional file extensions to include"
                },
                "force_reindex": {"type": "boolean", "description": "Rebuild the index from scratch"}
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: self.name().to_string(),
                message: "missing required string argument 'path'".to_string(),
            })?;
        let extensions: Option<Vec<String>> = args.get("extensions").and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
        });
        let force_reindex = args
            .get("force_reindex")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match self
            .retriever
            .index_directory(Path::new(path), extensions.as_deref(), force_reindex)
            .await
        {
            Ok(summary) => Ok(json!({
                "status": "success",
                "directory": summary.directory,
                "indexed_files": summary.indexed_files,
                "chunks": summary.chunks,
            })),
            Err(error) => Err(ToolError::Execution(error.to_string())),
        }
    }
}

/// Tool adapter for `retrieve_code_context`.
pub struct RetrieveContextTool {
    retriever: Arc<dyn CodeRetriever>,
    top_k: usize,
}

impl RetrieveContextTool {
    pub fn new(retriever: Arc<dyn CodeRetriever>, top_k: usize) -> Self {
        Self { retriever, top_k }
    }
}

#[async_trait]
impl Tool for RetrieveContextTool {
    fn name(&self) -> &str {
        "retrieve_code_context"
    }

    fn description(&self) -> &str {
        "Retrieve semantically relevant code chunks for a query."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Natural-language query"},
                "top_k": {"type": "number", "description": "Number of chunks to retrieve"}
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &mut ToolContext) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: self.name().to_string(),
                message: "missing required string argument 'query'".to_string(),
            })?;
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|value| value as usize)
            .unwrap_or(self.top_k);

        match self.retriever.retrieve_code_context(query, top_k).await {
            Ok(context) => Ok(json!({
                "status": "success",
                "query": context.query,
                "retrieved_chunks": context.retrieved_chunks,
            })),
            Err(error) => Err(ToolError::Execution(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn embedding_retry_stops_on_success() {
        let attempts = AtomicUsize::new(0);
        let tiny = [Duration::from_millis(1), Duration::from_millis(1)];
        let mut operation = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 1 {
                    Err(RagError::Embedding("busy".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        };
        let result = retry_with_delays(&mut operation, &tiny).await.unwrap();
        assert_eq!(result, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_embedding_errors_do_not_retry() {
        let attempts = AtomicUsize::new(0);
        let tiny = [Duration::from_millis(1)];
        let mut operation = || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RagError::Retrieval("no index".to_string())) }
        };
        let error = retry_with_delays(&mut operation, &tiny).await.unwrap_err();
        assert!(matches!(error, RagError::Retrieval(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
