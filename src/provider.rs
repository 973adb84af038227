//! Provider wiring for the binary.
//!
//! The agent core is transport-agnostic: any [`LlmProvider`] implementation
//! plugs in through the library API. The binary ships a single built-in
//! `echo` provider for wiring checks and offline demos; deployments select
//! a real transport by linking one in and naming it in the manifest's
//! `[agent]` section.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use opsmith_core::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse};

/// Offline provider that restates the request. Useful to exercise the run
/// loop, the context assembler, and session plumbing without a live API.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let prompt = request.last_user_content().unwrap_or_default();
        let preview: String = prompt.chars().take(240).collect();
        Ok(LlmResponse::from_text(format!(
            "[echo provider] I received your request: {preview}"
        )))
    }
}

/// Resolve a provider by name.
pub fn build_provider(name: &str) -> Result<Arc<dyn LlmProvider>> {
    match name {
        "echo" => Ok(Arc::new(EchoProvider)),
        other => bail!(
            "unknown provider '{other}': this build ships only the offline 'echo' provider; \
             link a transport crate and register it here"
        ),
    }
}
