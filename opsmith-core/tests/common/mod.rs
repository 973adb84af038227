//! Shared test support: a scripted LLM provider and agent construction
//! helpers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt as _;

use opsmith_core::agent::{Agent, AgentEvent};
use opsmith_core::config::{AgentConfig, ContextConfig};
use opsmith_core::core::token_counter::TokenCounter;
use opsmith_core::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse};
use opsmith_core::tools::file_ops::register_file_tools;
use opsmith_core::tools::registry::ToolRegistry;

/// Provider that pops canned outcomes in order and records every request.
pub struct ScriptedProvider {
    script: Mutex<Vec<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<LlmResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(LlmError::Provider {
                message: "script exhausted".to_string(),
            });
        }
        script.remove(0)
    }
}

/// Test configuration: proactive gathering off so assemblies are
/// deterministic.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        context: ContextConfig {
            enable_proactive_context: false,
            ..ContextConfig::default()
        },
        ..AgentConfig::default()
    }
}

/// Build an agent over the scripted provider with the built-in file tools.
pub async fn scripted_agent(
    provider: Arc<ScriptedProvider>,
    config: AgentConfig,
    workspace: &std::path::Path,
) -> Agent {
    let mut registry = ToolRegistry::new();
    register_file_tools(&mut registry).expect("file tools register");
    Agent::builder(config, provider, Arc::new(registry), workspace)
        .token_counter(TokenCounter::heuristic("test-model"))
        .build()
        .await
}

/// Drain one turn into a vector of events.
pub async fn collect_turn(agent: &mut Agent, message: &str) -> Vec<AgentEvent> {
    agent.run_turn(message.to_string()).collect::<Vec<_>>().await
}

/// All `AgentText` payloads in order.
pub fn agent_texts(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::AgentText { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
