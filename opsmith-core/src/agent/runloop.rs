//! The turn-oriented run loop.
//!
//! For each inbound user message the loop starts a turn, assembles context,
//! calls the LLM, routes the response through the planning manager,
//! dispatches tool calls, and completes the turn, all under circuit
//! breakers (event cap, wall-clock cap), a consecutive-error cap, and a
//! retry policy with exponential backoff and progressive context
//! shrinkage. The whole thing is exposed as an async event stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::Stream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::context::manager::render_context_block;
use crate::context::{ContextManager, ProactiveGatherer};
use crate::core::retry::{backoff_delay, is_retryable_llm_error};
use crate::core::state::{StateManager, TurnPhase};
use crate::core::telemetry::TelemetryManager;
use crate::core::token_counter::TokenCounter;
use crate::llm::{
    FunctionCall, GenerationConfig, LlmError, LlmProvider, LlmRequest, Message, MessageRole,
};
use crate::planning::{self, PlanningDecision, PlanningManager};
use crate::tools::orchestrator::{ToolExecution, ToolOrchestrator};
use crate::tools::registry::ToolRegistry;

use super::events::AgentEvent;
use super::filter::{CONTEXT_INJECTION_PREFIX, apply_smart_filter};
use super::optimizer::apply_shrinkage;
use super::response::{filtered_display_response, process_response};

/// Token reserve added to every base-prompt computation for JSON overhead
/// and response headroom.
const BASE_PROMPT_SAFETY_MARGIN: usize = 2000;

/// Circuit-breaker message for runaway event generation.
const COMPLEXITY_MESSAGE: &str = "I encountered an internal issue with response generation. The request may be too complex. Please try breaking it into smaller parts.";

/// Circuit-breaker message for a timed-out attempt.
const TIMEOUT_MESSAGE: &str =
    "The request is taking too long to process. Please try a simpler request or break it into smaller parts.";

const RATE_LIMIT_APOLOGY: &str = "I encountered API rate limits or server issues. I tried optimizing the request and retrying, but the issue persists. Please try again in a few moments or with a simpler request.";

const JSON_APOLOGY: &str = "I encountered a communication issue with the AI service. This appears to be a temporary issue. Please try your request again.";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert software engineering and DevOps assistant. You can read and modify files, search code, and run vetted shell commands through your tools. Be precise, verify your changes, and keep the user informed.";

/// Builder for [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    workspace_root: PathBuf,
    system_instruction: String,
    token_counter: Option<TokenCounter>,
    cancel: CancellationToken,
}

impl AgentBuilder {
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            workspace_root: workspace_root.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            token_counter: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Inject a pre-resolved token counter instead of probing the provider.
    pub fn token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn build(self) -> Agent {
        let counter = match self.token_counter {
            Some(counter) => counter,
            None => {
                TokenCounter::initialize(
                    &self.config.agent.model,
                    Some(Arc::clone(&self.provider)),
                )
                .await
            }
        };

        let mut context = ContextManager::new(self.config.context.clone(), counter.clone());
        if self.config.context.enable_proactive_context {
            context = context.with_proactive(ProactiveGatherer::new(self.workspace_root.clone()));
        }

        let orchestrator = Arc::new(ToolOrchestrator::new(
            Arc::clone(&self.registry),
            self.config.tools.clone(),
            self.workspace_root.clone(),
        ));

        Agent {
            planning: PlanningManager::new(self.config.planning.clone()),
            state: StateManager::new(),
            context,
            orchestrator,
            registry: self.registry,
            provider: self.provider,
            counter,
            system_instruction: self.system_instruction,
            cancel: self.cancel,
            telemetry: TelemetryManager::new(),
            config: self.config,
        }
    }
}

/// The top-level agent driving one conversation.
pub struct Agent {
    config: AgentConfig,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    state: StateManager,
    context: ContextManager,
    planning: PlanningManager,
    counter: TokenCounter,
    system_instruction: String,
    cancel: CancellationToken,
    telemetry: TelemetryManager,
}

enum AttemptOutcome {
    /// The transport failed; the retry policy decides what happens next.
    TransportError(LlmError),
    /// A circuit breaker tripped; the invocation is over.
    CircuitBroken,
}

impl Agent {
    pub fn builder(
        config: AgentConfig,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        workspace_root: impl Into<PathBuf>,
    ) -> AgentBuilder {
        AgentBuilder::new(config, provider, registry, workspace_root)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a spent cancellation token so the next turn starts un-cancelled.
    pub fn reset_cancellation(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn planning(&self) -> &PlanningManager {
        &self.planning
    }

    pub fn telemetry(&self) -> &TelemetryManager {
        &self.telemetry
    }

    /// Export the conversation in the external key-value representation.
    pub fn snapshot(&self) -> crate::core::state::LegacyState {
        self.state.snapshot_for_context()
    }

    /// Rebuild conversation state from an exported snapshot.
    pub fn restore_from_snapshot(
        &mut self,
        snapshot: &crate::core::state::LegacyState,
    ) -> Result<(), crate::core::state::StateValidationError> {
        self.state.sync_from_legacy_state(snapshot)
    }

    /// Process one user message, streaming events as they happen.
    pub fn run_turn(&mut self, user_message: String) -> impl Stream<Item = AgentEvent> + '_ {
        stream! {
            let max_retries = self.config.run_loop.max_retries;
            let max_events = self.config.run_loop.max_events_per_attempt;
            let attempt_timeout = Duration::from_secs(self.config.run_loop.attempt_timeout_secs);
            let max_consecutive = self.config.run_loop.max_consecutive_errors;

            // Start (or adopt) the turn, with a one-shot fresh-state restart
            // on invariant violations.
            let mut state_error_recovered = false;
            let turn_number = loop {
                match self.state.start_turn(Some(&user_message)) {
                    Ok(turn_number) => break turn_number,
                    Err(state_error) if !state_error_recovered => {
                        error!(%state_error, "state validation error, restarting with fresh state");
                        self.state.reset();
                        state_error_recovered = true;
                    }
                    Err(state_error) => {
                        yield AgentEvent::Error {
                            message: format!("state error: {state_error}"),
                        };
                        return;
                    }
                }
            };
            yield AgentEvent::TurnStarted { turn_number };
            self.telemetry.record_turn();

            let mut retry_count = 0u32;
            let mut consecutive_errors = 0u32;
            // An approved plan survives retry attempts: the planning manager
            // hands it over exactly once, but every attempt's request must
            // carry the execution instruction.
            let mut approved_plan: Option<String> = None;

            loop {
                let attempt_started = Instant::now();
                let mut event_count = 0usize;

                info!(
                    attempt = retry_count + 1,
                    max_attempts = max_retries + 1,
                    "run loop attempt starting"
                );

                // One attempt: build request, run the LLM/tool chain until a
                // final response or a failure.
                let mut request = self.build_request(&user_message).await;
                let decision = self.planning.handle_before_model(Some(&user_message), &mut request);

                match decision {
                    PlanningDecision::Synthesize(response) => {
                        let text = response.text().unwrap_or_default();
                        self.finish_turn_with_text(&text).await;
                        yield AgentEvent::AgentText { text };
                        yield AgentEvent::TurnCompleted { turn_number };
                        return;
                    }
                    PlanningDecision::PlanApproved(plan) => {
                        let note = planning::templates::approved_plan_system_message(&plan);
                        if let Err(state_error) = self.state.add_system_message(&note) {
                            warn!(%state_error, "could not record approved plan on turn");
                        }
                        self.context.add_system_message(&note).await;
                        approved_plan = Some(plan);
                    }
                    PlanningDecision::PassThrough => {}
                }
                if let Some(plan) = &approved_plan {
                    planning::rewrite_request_for_execution(&mut request, plan);
                }

                // Plan-generation turns go out bare: the planning prompt is
                // the whole request.
                if !self.planning.is_plan_generation_turn() {
                    let base_prompt_tokens = self.compute_base_prompt_tokens(&request).await;
                    self.context.sync_from_state(&self.state).await;
                    let assembled = self.context.assemble_context(base_prompt_tokens).await;
                    if !assembled.context.is_empty() {
                        inject_context_block(&mut request, &assembled.context);
                    }
                }

                let outcome = 'chain: loop {
                    if attempt_started.elapsed() > attempt_timeout {
                        error!(elapsed = ?attempt_started.elapsed(), "attempt wall-clock cap hit");
                        break 'chain AttemptOutcome::CircuitBroken;
                    }
                    if self.cancel.is_cancelled() {
                        self.abort_cancelled().await;
                        yield AgentEvent::TurnCompleted { turn_number };
                        return;
                    }

                    self.advance_phase_forward(TurnPhase::CallingLlm);
                    let llm_started = Instant::now();
                    let response = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.abort_cancelled().await;
                            yield AgentEvent::TurnCompleted { turn_number };
                            return;
                        }
                        response = self.provider.generate(request.clone()) => response,
                    };
                    let response = match response {
                        Ok(response) => response,
                        Err(llm_error) => break 'chain AttemptOutcome::TransportError(llm_error),
                    };
                    self.telemetry.record_llm_request(
                        &request.model,
                        llm_started.elapsed(),
                        response.usage.as_ref(),
                    );

                    consecutive_errors = 0;
                    self.advance_phase_forward(TurnPhase::ProcessingLlmResponse);

                    if let Some(usage) = response.usage {
                        event_count += 1;
                        yield AgentEvent::Usage { usage };
                    }

                    if let Some(intercepted) = self.planning.handle_after_model(&response) {
                        let text = intercepted.text().unwrap_or_default();
                        self.finish_turn_with_text(&text).await;
                        if self.planning.is_awaiting_approval() {
                            yield AgentEvent::PlanPresented { text };
                        } else {
                            yield AgentEvent::AgentText { text };
                        }
                        yield AgentEvent::TurnCompleted { turn_number };
                        return;
                    }

                    let processed = process_response(&response);

                    for thought in &processed.thought_summaries {
                        event_count += 1;
                        yield AgentEvent::Thought { text: thought.clone() };
                    }
                    if event_count > max_events {
                        break 'chain AttemptOutcome::CircuitBroken;
                    }

                    let text = processed.text();
                    if !text.is_empty() {
                        self.append_agent_text(&text);
                    }

                    if processed.has_function_calls() {
                        self.advance_phase_forward(TurnPhase::ExecutingTools);
                        let calls = processed.function_calls.clone();
                        for call in &calls {
                            self.record_tool_call(call).await;
                            event_count += 1;
                            yield AgentEvent::ToolCallStarted {
                                tool_name: call.name.clone(),
                                args: call.args.clone(),
                            };
                        }
                        if event_count > max_events {
                            break 'chain AttemptOutcome::CircuitBroken;
                        }

                        let executions = self.execute_calls(&calls).await;
                        for execution in &executions {
                            self.telemetry
                                .record_tool_usage(&execution.tool_name, execution.error.is_none());
                            self.record_tool_outcome(execution).await;
                            event_count += 1;
                            yield AgentEvent::ToolCallCompleted {
                                tool_name: execution.tool_name.clone(),
                                is_error: execution.error.is_some(),
                            };
                        }
                        if event_count > max_events {
                            break 'chain AttemptOutcome::CircuitBroken;
                        }

                        // Cancellation never kills an in-flight tool; the
                        // results above are recorded before we stop.
                        if self.cancel.is_cancelled() {
                            self.abort_cancelled().await;
                            yield AgentEvent::TurnCompleted { turn_number };
                            return;
                        }

                        extend_request_with_tool_round(&mut request, &text, calls, &executions);
                        continue 'chain;
                    }

                    // Final response: thought-only output is suppressed, text
                    // is delivered unchanged.
                    if !processed.thought_summaries.is_empty() {
                        if let Some(display) = filtered_display_response(&processed, response.usage)
                        {
                            let display_text = display.text().unwrap_or_default();
                            event_count += 1;
                            yield AgentEvent::AgentText { text: display_text };
                        }
                    } else if !text.is_empty() {
                        event_count += 1;
                        yield AgentEvent::AgentText { text: text.clone() };
                    }
                    let _ = event_count;

                    self.advance_phase_forward(TurnPhase::Finalizing);
                    self.complete_turn().await;
                    yield AgentEvent::TurnCompleted { turn_number };
                    return;
                };

                match outcome {
                    AttemptOutcome::CircuitBroken => {
                        let message = if attempt_started.elapsed() > attempt_timeout {
                            TIMEOUT_MESSAGE
                        } else {
                            COMPLEXITY_MESSAGE
                        };
                        self.state.record_error(message);
                        self.complete_turn().await;
                        yield AgentEvent::Error { message: message.to_string() };
                        yield AgentEvent::TurnCompleted { turn_number };
                        return;
                    }
                    AttemptOutcome::TransportError(llm_error) => {
                        consecutive_errors += 1;
                        let rendered = llm_error.to_string();
                        self.state.record_error(&rendered);

                        if consecutive_errors >= max_consecutive {
                            error!(consecutive_errors, "too many consecutive errors, aborting");
                            self.complete_turn().await;
                            yield AgentEvent::Error {
                                message: format!(
                                    "too many consecutive errors ({consecutive_errors}): {rendered}"
                                ),
                            };
                            yield AgentEvent::TurnCompleted { turn_number };
                            return;
                        }

                        if is_retryable_llm_error(&llm_error) && retry_count < max_retries {
                            retry_count += 1;
                            self.telemetry.record_retry();
                            warn!(
                                attempt = retry_count,
                                max_retries,
                                error = %rendered,
                                "retryable transport error, shrinking context and backing off"
                            );
                            if let Err(state_error) = apply_shrinkage(
                                retry_count,
                                &mut self.state,
                                &mut self.context,
                                self.config.context.keep_goal_on_full_reset,
                            ) {
                                warn!(%state_error, "shrinkage failed, continuing with retry anyway");
                            }

                            let delay = backoff_delay(retry_count);
                            yield AgentEvent::Retrying {
                                attempt: retry_count,
                                delay_secs: delay.as_secs_f64(),
                                error: rendered,
                            };
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    self.abort_cancelled().await;
                                    yield AgentEvent::TurnCompleted { turn_number };
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }

                        let message = user_facing_error(&llm_error);
                        self.complete_turn().await;
                        yield AgentEvent::Error { message };
                        yield AgentEvent::TurnCompleted { turn_number };
                        return;
                    }
                }
            }
        }
    }

    /// Build the outgoing request from conversation state, then filter it.
    async fn build_request(&mut self, user_message: &str) -> LlmRequest {
        let mut contents = Vec::new();
        contents.push(Message::system(&self.system_instruction));

        for turn in self.state.history() {
            for note in &turn.system_messages {
                contents.push(Message::system(note));
            }
            if let Some(user) = &turn.user_message {
                contents.push(Message::user(user));
            }
            if let Some(agent) = &turn.agent_message {
                contents.push(Message::assistant(agent));
            }
        }
        if let Some(current) = self.state.current_turn() {
            for note in &current.system_messages {
                contents.push(Message::system(note));
            }
            if let Some(user) = &current.user_message {
                contents.push(Message::user(user));
            }
        }

        apply_smart_filter(&mut contents, user_message);

        LlmRequest {
            model: self.config.agent.model.clone(),
            contents,
            tools: self.registry.definitions(),
            config: GenerationConfig::default(),
        }
    }

    /// Base prompt tokens: instruction, tool schemas, and the filtered
    /// request contents (minus injected context blocks), plus a fixed
    /// reserve. Historical conversation is the context manager's business
    /// and is excluded here.
    async fn compute_base_prompt_tokens(&self, request: &LlmRequest) -> usize {
        let mut tokens = self.counter.count(&self.system_instruction).await;
        if !request.tools.is_empty() {
            let schema = serde_json::to_string(&request.tools).unwrap_or_default();
            tokens += self.counter.count(&schema).await;
        }
        for message in &request.contents {
            if message.role == MessageRole::System {
                continue;
            }
            if message.content.starts_with(CONTEXT_INJECTION_PREFIX) {
                continue;
            }
            tokens += self.counter.count(&message.content).await;
        }
        tokens + BASE_PROMPT_SAFETY_MARGIN
    }

    fn advance_phase_forward(&mut self, phase: TurnPhase) {
        let should_advance = self
            .state
            .current_turn()
            .map(|turn| turn.phase < phase)
            .unwrap_or(false);
        if should_advance {
            if let Err(state_error) = self.state.advance_phase(phase) {
                warn!(%state_error, "phase advance rejected");
            }
        }
    }

    fn append_agent_text(&mut self, text: &str) {
        let combined = match self
            .state
            .current_turn()
            .and_then(|turn| turn.agent_message.clone())
        {
            Some(existing) => format!("{existing}\n{text}"),
            None => text.to_string(),
        };
        if let Err(state_error) = self.state.update_current_turn(
            crate::core::state::TurnUpdate::agent_message(combined),
        ) {
            warn!(%state_error, "could not record agent message");
        }
    }

    async fn record_tool_call(&mut self, call: &FunctionCall) {
        if let Err(state_error) = self.state.add_tool_call(&call.name, call.args.clone()) {
            warn!(%state_error, "could not record tool call");
        }
        let turn_number = self.context.current_turn_number();
        self.context
            .add_turn_tool_call(turn_number, &call.name, call.args.clone())
            .await;
    }

    async fn execute_calls(&mut self, calls: &[FunctionCall]) -> Vec<ToolExecution> {
        let batch: Vec<(String, Value)> = calls
            .iter()
            .map(|call| (call.name.clone(), call.args.clone()))
            .collect();
        if batch.len() == 1 {
            let (tool_name, args) = batch.into_iter().next().unwrap_or_default();
            vec![
                self.orchestrator
                    .execute_tool(&tool_name, args, Vec::new(), None)
                    .await,
            ]
        } else {
            self.orchestrator.execute_parallel(batch).await
        }
    }

    async fn record_tool_outcome(&mut self, execution: &ToolExecution) {
        let value = execution_result_value(execution);
        if let Err(state_error) = self.state.add_tool_result(&execution.tool_name, value.clone()) {
            warn!(%state_error, "could not record tool result");
        }
        self.context
            .add_tool_result(&execution.tool_name, value, None)
            .await;
    }

    async fn finish_turn_with_text(&mut self, text: &str) {
        if !text.is_empty() {
            self.append_agent_text(text);
        }
        self.complete_turn().await;
    }

    async fn complete_turn(&mut self) {
        let turn_number = self
            .state
            .current_turn()
            .map(|turn| turn.turn_number)
            .unwrap_or(0);
        if let Some(agent_message) = self
            .state
            .current_turn()
            .and_then(|turn| turn.agent_message.clone())
        {
            self.context
                .update_agent_response(turn_number, &agent_message)
                .await;
        }
        if let Err(state_error) = self.state.complete_current_turn() {
            error!(%state_error, "failed to complete turn, resetting state");
            self.state.reset();
        }
    }

    async fn abort_cancelled(&mut self) {
        info!("cancellation requested, finishing turn with error note");
        self.state.record_error("invocation cancelled by user");
        self.complete_turn().await;
    }
}

fn execution_result_value(execution: &ToolExecution) -> Value {
    match (&execution.result, &execution.error) {
        (Some(result), _) => result.clone(),
        (None, Some(error)) => json!({"status": "error", "message": error}),
        (None, None) => json!({"status": "error", "message": "no result"}),
    }
}

/// Insert the assembled context as a user-role message after any system
/// messages.
fn inject_context_block(request: &mut LlmRequest, context: &serde_json::Map<String, Value>) {
    let block = render_context_block(context);
    let position = request
        .contents
        .iter()
        .position(|message| message.role != MessageRole::System)
        .unwrap_or(request.contents.len());
    request.contents.insert(position, Message::user(block));
}

/// Append the assistant's tool-calling message and the tool results so the
/// next LLM call sees the whole exchange.
fn extend_request_with_tool_round(
    request: &mut LlmRequest,
    assistant_text: &str,
    calls: Vec<FunctionCall>,
    executions: &[ToolExecution],
) {
    request
        .contents
        .push(Message::assistant_with_calls(assistant_text, calls));
    for execution in executions {
        request.contents.push(Message::tool_response(
            &execution.tool_name,
            execution_result_value(execution),
        ));
    }
}

/// Type-specific user-facing rendering of a terminal transport failure.
fn user_facing_error(llm_error: &LlmError) -> String {
    let rendered = llm_error.to_string();
    if (rendered.contains("429") && rendered.contains("RESOURCE_EXHAUSTED"))
        || (rendered.contains("500")
            && (rendered.contains("INTERNAL") || rendered.contains("ServerError")))
        || matches!(llm_error, LlmError::RateLimit { .. })
    {
        return RATE_LIMIT_APOLOGY.to_string();
    }
    if rendered.to_lowercase().contains("json") {
        return JSON_APOLOGY.to_string();
    }
    let pipe_hint = if rendered.contains("Broken pipe") || rendered.contains("EOF") {
        " (possibly due to an issue with an external tool process)"
    } else {
        ""
    };
    format!(
        "I encountered an unexpected internal issue{pipe_hint}. I cannot proceed with this request. Details: {}: {rendered}",
        llm_error.kind()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ContextConfig};
    use crate::llm::{LlmResponse, Part, UsageMetadata};
    use crate::tools::file_ops::register_file_tools;
    use async_trait::async_trait;
    use futures::StreamExt as _;
    use std::sync::Mutex as StdMutex;

    /// Scripted provider: pops canned outcomes in order.
    struct ScriptedProvider {
        script: StdMutex<Vec<Result<LlmResponse, LlmError>>>,
        requests: StdMutex<Vec<LlmRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LlmResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn recorded_requests(&self) -> Vec<LlmRequest> {
            self.requests.lock().unwrap().clone()
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

    fn test_config() -> AgentConfig {
        AgentConfig {
            context: ContextConfig {
                enable_proactive_context: false,
                ..ContextConfig::default()
            },
            ..AgentConfig::default()
        }
    }

    async fn agent_with(
        provider: Arc<ScriptedProvider>,
        config: AgentConfig,
        workspace: &std::path::Path,
    ) -> Agent {
        let mut registry = ToolRegistry::new();
        register_file_tools(&mut registry).unwrap();
        Agent::builder(config, provider, Arc::new(registry), workspace)
            .token_counter(TokenCounter::heuristic("test-model"))
            .build()
            .await
    }

    async fn collect(agent: &mut Agent, message: &str) -> Vec<AgentEvent> {
        agent.run_turn(message.to_string()).collect::<Vec<_>>().await
    }

    fn texts(events: &[AgentEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::AgentText { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_exploration_query_flows_through_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Ok(LlmResponse::from_text(
            "src contains lib.rs and main.rs",
        ))]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let events = collect(&mut agent, "list files in src/").await;

        assert_eq!(provider.recorded_requests().len(), 1);
        assert_eq!(texts(&events), vec!["src contains lib.rs and main.rs"]);
        assert_eq!(agent.state().history().len(), 1);
        assert!(!events
            .iter()
            .any(|event| matches!(event, AgentEvent::Retrying { .. })));
        assert!(!agent.planning().is_awaiting_approval());
    }

    #[tokio::test]
    async fn transient_server_error_retries_once_with_shrinkage() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Provider {
                message: "ServerError 500 INTERNAL".to_string(),
            }),
            Ok(LlmResponse::from_text("recovered answer")),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let started = Instant::now();
        let events = collect(&mut agent, "summarize the repo").await;
        let elapsed = started.elapsed().as_secs_f64();

        assert_eq!(provider.recorded_requests().len(), 2);
        let retrying: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, AgentEvent::Retrying { .. }))
            .collect();
        assert_eq!(retrying.len(), 1);
        // Backoff for the first retry is 2s plus jitter in [0.1, 0.5).
        assert!(elapsed >= 2.1, "elapsed {elapsed}");
        assert!(elapsed < 4.0, "elapsed {elapsed}");
        assert_eq!(texts(&events), vec!["recovered answer"]);
        // Shrinkage level 1 was applied.
        assert_eq!(agent.context().config().target_recent_turns, 2);
        // The turn completed exactly once.
        assert_eq!(agent.state().history().len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_apology() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Err(LlmError::Authentication {
            message: "invalid api key".to_string(),
        })]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let events = collect(&mut agent, "do something").await;

        assert_eq!(provider.recorded_requests().len(), 1);
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Error { message } if message.contains("unexpected internal issue")
        )));
    }

    #[tokio::test]
    async fn function_calls_are_executed_and_fed_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok(LlmResponse {
                parts: vec![Part::FunctionCall(FunctionCall::new(
                    "read_file",
                    json!({"file_path": "notes.txt"}),
                ))],
                usage: None,
                raw: None,
            }),
            Ok(LlmResponse::from_text("the note says: remember the milk")),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let events = collect(&mut agent, "read notes.txt and summarize").await;

        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::ToolCallStarted { tool_name, .. } if tool_name == "read_file"
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::ToolCallCompleted { is_error: false, .. }
        )));

        // The second request carries the tool round.
        let requests = provider.recorded_requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert!(second
            .contents
            .iter()
            .any(|message| message.is_tool_result()));

        // Both records landed on the turn.
        let turn = &agent.state().history()[0];
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn planning_flow_presents_plan_then_executes_on_approval() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok(LlmResponse::from_text("Here's my comprehensive plan: 1. 2. 3.")),
            Ok(LlmResponse::from_text("executing step one")),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let events = collect(
            &mut agent,
            "implement user authentication and then write tests and deploy",
        )
        .await;

        let plan_text = events
            .iter()
            .find_map(|event| match event {
                AgentEvent::PlanPresented { text } => Some(text.clone()),
                _ => None,
            })
            .expect("plan should be presented");
        assert!(plan_text.contains("Here's my comprehensive plan"));
        assert!(plan_text.contains("type 'approve' to proceed"));

        // The plan-generation request was rewritten and tool-free.
        let requests = provider.recorded_requests();
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].contents.iter().any(|message| message
            .content
            .contains("--- USER REQUEST ---")));

        // Approval collapses the user contents into an execution
        // instruction and restores tools.
        let events = collect(&mut agent, "approve").await;
        assert_eq!(texts(&events), vec!["executing step one"]);

        let requests = provider.recorded_requests();
        let second = &requests[1];
        assert!(!second.tools.is_empty());
        let user_messages: Vec<_> = second
            .contents
            .iter()
            .filter(|message| message.role == MessageRole::User
                && !message.content.starts_with(CONTEXT_INJECTION_PREFIX))
            .collect();
        assert_eq!(user_messages.len(), 1);
        assert!(user_messages[0].content.contains("APPROVED PLAN:"));
    }

    #[tokio::test]
    async fn unrelated_message_after_plan_resets_and_processes_normally() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok(LlmResponse::from_text("the plan")),
            Ok(LlmResponse::from_text("cluster looks healthy")),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        collect(&mut agent, "implement auth and then deploy it").await;
        assert!(agent.planning().is_awaiting_approval());

        let events = collect(&mut agent, "what is the status of the k8s cluster").await;
        assert!(!agent.planning().is_awaiting_approval());
        assert_eq!(texts(&events), vec!["cluster looks healthy"]);
    }

    #[tokio::test]
    async fn thought_only_response_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Ok(LlmResponse {
            parts: vec![Part::Thought("internal reasoning".to_string())],
            usage: Some(UsageMetadata {
                prompt_token_count: 10,
                candidates_token_count: 5,
                total_token_count: 15,
                thoughts_token_count: Some(5),
            }),
            raw: None,
        })]);
        let mut agent = agent_with(Arc::clone(&provider), test_config(), dir.path()).await;

        let events = collect(&mut agent, "explain the design").await;

        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::Thought { .. })));
        assert!(texts(&events).is_empty());
        assert!(events
            .iter()
            .any(|event| matches!(event, AgentEvent::TurnCompleted { .. })));
    }

    #[tokio::test]
    async fn consecutive_error_cap_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.run_loop.max_consecutive_errors = 2;
        config.run_loop.max_retries = 5;
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Provider { message: "503 UNAVAILABLE".to_string() }),
            Err(LlmError::Provider { message: "503 UNAVAILABLE".to_string() }),
            Err(LlmError::Provider { message: "503 UNAVAILABLE".to_string() }),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), config, dir.path()).await;

        let events = collect(&mut agent, "flaky request").await;

        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Error { message } if message.contains("consecutive errors")
        )));
        assert_eq!(provider.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn retries_never_exceed_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.run_loop.max_retries = 1;
        config.run_loop.max_consecutive_errors = 10;
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::Provider { message: "503 UNAVAILABLE".to_string() }),
            Err(LlmError::Provider { message: "503 UNAVAILABLE".to_string() }),
            Ok(LlmResponse::from_text("never reached")),
        ]);
        let mut agent = agent_with(Arc::clone(&provider), config, dir.path()).await;

        let events = collect(&mut agent, "flaky request").await;

        // One initial attempt plus one retry.
        assert_eq!(provider.recorded_requests().len(), 2);
        let retry_events = events
            .iter()
            .filter(|event| matches!(event, AgentEvent::Retrying { .. }))
            .count();
        assert_eq!(retry_events, 1);
    }
}
