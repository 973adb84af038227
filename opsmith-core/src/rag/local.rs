//! Local keyword-based code retriever.
//!
//! A deliberately simple retriever: no embeddings, no database. Files are
//! chunked by lines, indexed by lowercased terms, and retrieval scores
//! chunks by term overlap with the query. Content hashes skip unchanged
//! files on re-index. Serves as the default [`CodeRetriever`] so retrieval
//! tools work out of the box; a vector store can replace it behind the
//! same trait.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest as _, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ChunkMetadata, CodeRetriever, IndexSummary, RagError, RetrievedChunk,
    RetrievedContext};

/// Lines per indexed chunk.
const CHUNK_LINES: usize = 60;

/// File extensions indexed when the caller names none.
const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "go", "java", "rb", "sh", "toml", "yaml", "yml", "tf", "md",
];

/// Directories never indexed.
const IGNORED_DIRECTORIES: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

#[derive(Debug, Clone)]
struct IndexedChunk {
    id: String,
    file_path: String,
    chunk_name: String,
    start_line: usize,
    end_line: usize,
    document: String,
    terms: HashSet<String>,
}

/// In-memory keyword index over a workspace.
#[derive(Default)]
pub struct LocalCodeRetriever {
    chunks: RwLock<Vec<IndexedChunk>>,
    file_hashes: RwLock<HashMap<String, String>>,
}

impl LocalCodeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.read().await.len()
    }
}

#[async_trait]
impl CodeRetriever for LocalCodeRetriever {
    async fn index_directory(
        &self,
        path: &Path,
        extensions: Option<&[String]>,
        force_reindex: bool,
    ) -> Result<IndexSummary, RagError> {
        if !path.is_dir() {
            return Err(RagError::Indexing(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let wanted: Vec<String> = match extensions {
            Some(extensions) => extensions.iter().map(|e| e.to_lowercase()).collect(),
            None => DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        };

        let mut indexed_files = 0usize;
        let mut new_chunks = 0usize;

        for entry in WalkDir::new(path)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !IGNORED_DIRECTORIES.contains(&name))
                    .unwrap_or(false)
            })
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let extension = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if !wanted.iter().any(|w| *w == extension) {
                continue;
            }

            let file_path = entry
                .path()
                .strip_prefix(path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();

            let content = match tokio::fs::read_to_string(entry.path()).await {
                Ok(content) => content,
                Err(error) => {
                    warn!(file = %file_path, %error, "skipping unreadable file");
                    continue;
                }
            };

            let hash = content_hash(&content);
            {
                let hashes = self.file_hashes.read().await;
                if !force_reindex && hashes.get(&file_path) == Some(&hash) {
                    continue;
                }
            }

            let file_chunks = chunk_file(&file_path, &content);
            new_chunks += file_chunks.len();
            indexed_files += 1;

            let mut chunks = self.chunks.write().await;
            chunks.retain(|chunk| chunk.file_path != file_path);
            chunks.extend(file_chunks);
            drop(chunks);
            self.file_hashes.write().await.insert(file_path, hash);
        }

        let total = self.chunks.read().await.len();
        info!(
            directory = %path.display(),
            indexed_files,
            new_chunks,
            total_chunks = total,
            "indexed directory"
        );
        Ok(IndexSummary {
            directory: path.display().to_string(),
            indexed_files,
            chunks: total,
        })
    }

    async fn retrieve_code_context(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<RetrievedContext, RagError> {
        let query_terms = terms_of(query);
        if query_terms.is_empty() {
            return Err(RagError::Retrieval("empty query".to_string()));
        }

        let chunks = self.chunks.read().await;
        let mut scored: Vec<(f64, &IndexedChunk)> = chunks
            .iter()
            .filter_map(|chunk| {
                let overlap = query_terms
                    .iter()
                    .filter(|term| chunk.terms.contains(*term))
                    .count();
                if overlap == 0 {
                    return None;
                }
                let score = overlap as f64 / query_terms.len() as f64;
                Some((score, chunk))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let retrieved_chunks: Vec<RetrievedChunk> = scored
            .into_iter()
            .take(top_k)
            .map(|(score, chunk)| RetrievedChunk {
                id: chunk.id.clone(),
                metadata: ChunkMetadata {
                    file_path: chunk.file_path.clone(),
                    chunk_name: chunk.chunk_name.clone(),
                    chunk_type: "code".to_string(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                },
                document: chunk.document.clone(),
                distance: 1.0 - score,
            })
            .collect();

        debug!(query, results = retrieved_chunks.len(), "retrieved code context");
        Ok(RetrievedContext {
            query: query.to_string(),
            retrieved_chunks,
        })
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn terms_of(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|term| term.len() >= 3)
        .map(str::to_owned)
        .collect()
}

/// Name a chunk after the first declaration it contains, falling back to
/// the file stem and start line.
fn chunk_name(file_path: &str, start_line: usize, text: &str) -> String {
    static DECLARATION: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(
            r"(?m)^\s*(?:pub\s+)?(?:fn|struct|enum|trait|impl|class|def|function)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("declaration pattern is valid")
    });
    if let Some(captures) = DECLARATION.captures(text) {
        if let Some(name) = captures.get(1) {
            return name.as_str().to_string();
        }
    }
    let stem = Path::new(file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");
    format!("{stem}:{start_line}")
}

fn chunk_file(file_path: &str, content: &str) -> Vec<IndexedChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + CHUNK_LINES).min(lines.len());
        let document = lines[start..end].join("\n");
        chunks.push(IndexedChunk {
            id: format!("{file_path}:{}", start + 1),
            file_path: file_path.to_string(),
            chunk_name: chunk_name(file_path, start + 1, &document),
            start_line: start + 1,
            end_line: end,
            terms: terms_of(&document),
            document,
        });
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    async fn indexed_workspace() -> (tempfile::TempDir, LocalCodeRetriever) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/auth.rs"),
            "pub fn authenticate_user(token: &str) -> bool {\n    token.starts_with(\"valid\")\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("src/db.rs"),
            "pub fn connect_database(url: &str) {\n    // open a connection pool\n}\n",
        )
        .unwrap();
        fs::write(dir.path().join("image.png"), "not indexed").unwrap();

        let retriever = LocalCodeRetriever::new();
        retriever
            .index_directory(dir.path(), None, false)
            .await
            .unwrap();
        (dir, retriever)
    }

    #[tokio::test]
    async fn indexes_only_wanted_extensions() {
        let (_dir, retriever) = indexed_workspace().await;
        assert_eq!(retriever.chunk_count().await, 2);
    }

    #[tokio::test]
    async fn retrieval_ranks_by_term_overlap() {
        let (_dir, retriever) = indexed_workspace().await;
        let context = retriever
            .retrieve_code_context("authenticate_user token validation", 5)
            .await
            .unwrap();

        assert!(!context.retrieved_chunks.is_empty());
        let top = &context.retrieved_chunks[0];
        assert_eq!(top.metadata.file_path, "src/auth.rs");
        assert_eq!(top.metadata.chunk_name, "authenticate_user");
        assert!(top.distance < 1.0);
    }

    #[tokio::test]
    async fn unchanged_files_are_skipped_on_reindex() {
        let (dir, retriever) = indexed_workspace().await;
        let summary = retriever
            .index_directory(dir.path(), None, false)
            .await
            .unwrap();
        assert_eq!(summary.indexed_files, 0);

        let forced = retriever
            .index_directory(dir.path(), None, true)
            .await
            .unwrap();
        assert_eq!(forced.indexed_files, 2);
        assert_eq!(retriever.chunk_count().await, 2);
    }

    #[tokio::test]
    async fn modified_files_are_reindexed() {
        let (dir, retriever) = indexed_workspace().await;
        fs::write(
            dir.path().join("src/auth.rs"),
            "pub fn verify_session(cookie: &str) -> bool {\n    false\n}\n",
        )
        .unwrap();

        let summary = retriever
            .index_directory(dir.path(), None, false)
            .await
            .unwrap();
        assert_eq!(summary.indexed_files, 1);

        let context = retriever
            .retrieve_code_context("verify_session cookie", 5)
            .await
            .unwrap();
        assert_eq!(context.retrieved_chunks[0].metadata.file_path, "src/auth.rs");
        assert!(retriever
            .retrieve_code_context("authenticate_user", 5)
            .await
            .unwrap()
            .retrieved_chunks
            .is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_an_indexing_error() {
        let retriever = LocalCodeRetriever::new();
        let error = retriever
            .index_directory(Path::new("/does/not/exist"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(error, RagError::Indexing(_)));
    }

    #[tokio::test]
    async fn empty_query_is_a_retrieval_error() {
        let (_dir, retriever) = indexed_workspace().await;
        let error = retriever.retrieve_code_context("!!", 5).await.unwrap_err();
        assert!(matches!(error, RagError::Retrieval(_)));
    }
}
