use async_trait::async_trait;

use super::types::{LlmRequest, LlmResponse};

/// Transport-level error surfaced by a provider.
///
/// The run loop's retry classifier matches on the rendered message plus the
/// variant name, so providers should preserve upstream status markers
/// (`429`, `RESOURCE_EXHAUSTED`, `UNAVAILABLE`, ...) in `message`.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },
    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("Network error: {message}")]
    Network { message: String },
    #[error("Provider error: {message}")]
    Provider { message: String },
    #[error("Token counting unsupported by provider")]
    CountTokensUnsupported,
}

impl LlmError {
    /// Short type name used by the retry classifier alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Authentication { .. } => "Authentication",
            LlmError::RateLimit { .. } => "RateLimit",
            LlmError::InvalidRequest { .. } => "InvalidRequest",
            LlmError::Network { .. } => "Network",
            LlmError::Provider { .. } => "Provider",
            LlmError::CountTokensUnsupported => "CountTokensUnsupported",
        }
    }
}

/// Universal LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "gemini", "openai", "anthropic").
    fn name(&self) -> &str;

    /// Generate a completion for the request.
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Count tokens for `text` under `model` using the provider's native
    /// counter. Providers without one return
    /// [`LlmError::CountTokensUnsupported`]; the token counter probes this
    /// once at startup and falls back to local encodings.
    async fn count_tokens(&self, _model: &str, _text: &str) -> Result<usize, LlmError> {
        Err(LlmError::CountTokensUnsupported)
    }
}
