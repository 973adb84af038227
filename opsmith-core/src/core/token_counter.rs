//! Token counting with a fallback chain of backends.
//!
//! Resolution order at construction: the transport's native counter (probed
//! once), a byte-pair encoding matched to the model family, the generic
//! default encoding, and finally a chars/4 heuristic. The first backend that
//! succeeds is bound for the lifetime of the counter; a runtime failure of
//! the bound backend falls through to the heuristic for that call only and
//! does not rebind.
//!
//! Counts are monotonic in substring extension for any single backend.
//! Counts across backends are not comparable; consumers must not mix
//! counters.

use std::sync::Arc;

use tokenizers::Tokenizer;
use tokio::task;
use tracing::{debug, warn};

use crate::llm::LlmProvider;

/// Identifier of the generic default encoding used when no model-family
/// mapping exists.
const DEFAULT_ENCODING: &str = "openai-community/gpt2";

#[derive(Clone)]
enum CounterBackend {
    /// Transport-native counter, confirmed by a probe at construction.
    Native {
        provider: Arc<dyn LlmProvider>,
        model: String,
    },
    /// Local byte-pair encoding.
    Encoding(Arc<Tokenizer>),
    /// chars/4 estimate.
    Heuristic,
}

impl CounterBackend {
    fn describe(&self) -> &'static str {
        match self {
            CounterBackend::Native { .. } => "native",
            CounterBackend::Encoding(_) => "encoding",
            CounterBackend::Heuristic => "heuristic",
        }
    }
}

/// Counts tokens for any string under a configured model.
#[derive(Clone)]
pub struct TokenCounter {
    backend: CounterBackend,
    model: String,
}

impl TokenCounter {
    /// Resolve the best available backend for `model`.
    pub async fn initialize(model: &str, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        if let Some(provider) = provider {
            match provider.count_tokens(model, "test").await {
                Ok(count) if count > 0 => {
                    debug!(model, provider = provider.name(), "using native token counter");
                    return Self {
                        backend: CounterBackend::Native {
                            provider,
                            model: model.to_string(),
                        },
                        model: model.to_string(),
                    };
                }
                Ok(_) => {
                    warn!(
                        model,
                        "native token counter probe returned zero tokens, falling back"
                    );
                }
                Err(error) => {
                    warn!(model, %error, "native token counter unavailable, falling back");
                }
            }
        }

        if let Some(tokenizer) = load_encoding(encoding_for_model(model)).await {
            debug!(model, "using model-family encoding for token counting");
            return Self {
                backend: CounterBackend::Encoding(Arc::new(tokenizer)),
                model: model.to_string(),
            };
        }

        if let Some(tokenizer) = load_encoding(DEFAULT_ENCODING.to_string()).await {
            debug!(model, "using default encoding for token counting");
            return Self {
                backend: CounterBackend::Encoding(Arc::new(tokenizer)),
                model: model.to_string(),
            };
        }

        warn!(
            model,
            "no tokenizer available, using character-based estimation"
        );
        Self::heuristic(model)
    }

    /// Character-estimate counter, used as terminal fallback and in tests.
    pub fn heuristic(model: &str) -> Self {
        Self {
            backend: CounterBackend::Heuristic,
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Name of the bound backend, for diagnostics.
    pub fn backend_name(&self) -> &'static str {
        self.backend.describe()
    }

    /// Count tokens in `text`. Never fails: backend errors degrade to the
    /// chars/4 estimate for this call only.
    pub async fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        match &self.backend {
            CounterBackend::Native { provider, model } => {
                match provider.count_tokens(model, text).await {
                    Ok(count) => count,
                    Err(error) => {
                        warn!(%error, "native token count failed, using estimate for this call");
                        estimate_tokens(text)
                    }
                }
            }
            CounterBackend::Encoding(tokenizer) => match tokenizer.encode(text, true) {
                Ok(encoding) => encoding.len(),
                Err(error) => {
                    warn!(%error, "encoding failed, using estimate for this call");
                    estimate_tokens(text)
                }
            },
            CounterBackend::Heuristic => estimate_tokens(text),
        }
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

async fn load_encoding(identifier: String) -> Option<Tokenizer> {
    let for_log = identifier.clone();
    let result = task::spawn_blocking(move || Tokenizer::from_pretrained(&identifier, None)).await;
    match result {
        Ok(Ok(tokenizer)) => Some(tokenizer),
        Ok(Err(error)) => {
            debug!(encoding = %for_log, %error, "failed to load encoding");
            None
        }
        Err(error) => {
            debug!(encoding = %for_log, %error, "encoding load task failed");
            None
        }
    }
}

fn encoding_for_model(model: &str) -> String {
    let normalized = model.to_ascii_lowercase();

    let id = if normalized.contains("gpt-4o") || normalized.contains("gpt-5") {
        "openai-community/gpt-4o-mini-tokenizer"
    } else if normalized.contains("gpt") {
        "openai-community/gpt2"
    } else if normalized.contains("gemini") {
        "google/gemma-2b"
    } else if normalized.contains("claude") {
        "Xenova/claude-3-haiku-20240307"
    } else if normalized.contains("qwen") {
        "Qwen/Qwen1.5-7B-Chat"
    } else {
        DEFAULT_ENCODING
    };
    id.to_string()
}
