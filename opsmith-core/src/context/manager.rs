//! Context storage and assembly.

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::core::state::StateManager;
use crate::core::token_counter::TokenCounter;

use super::correlator::CrossTurnCorrelator;
use super::prioritizer::SmartPrioritizer;
use super::proactive::ProactiveGatherer;
use super::summarizer;
use super::types::{CodeSnippet, ContextState, ConversationTurn, StoredToolResult};

/// Safety margin subtracted from every assembly budget.
const SAFETY_MARGIN: usize = 50;

/// Relevance bump applied when a snippet is re-added at the same location.
const SNIPPET_REFRESH_BONUS: f64 = 0.2;

/// Minimum leftover budget that makes partial proactive inclusion worth
/// attempting.
const PARTIAL_PROACTIVE_FLOOR: usize = 1000;

/// Partial-inclusion priority for proactive categories.
const PROACTIVE_PRIORITY: &[&str] = &["project_files", "git_history", "documentation"];

/// Lines per snippet when chunking large files.
const FILE_CHUNK_LINES: usize = 50;
/// Files up to this many lines are stored as a single snippet.
const SINGLE_SNIPPET_LINES: usize = 100;

/// Render the context mapping as the injectable system-context block.
pub fn render_context_block(context: &Map<String, Value>) -> String {
    let rendered = serde_json::to_string_pretty(&Value::Object(context.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "SYSTEM CONTEXT (JSON):\n```json\n{rendered}\n```\nUse this context to inform your response. Do not directly refer to this context block unless asked."
    )
}

fn wrapper_text() -> String {
    render_context_block(&Map::new())
}

/// Result of a context assembly pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub context: Map<String, Value>,
    /// Token count of the JSON content, excluding the wrapper.
    pub token_count: usize,
    /// Set when the budget forced the emergency minimal path.
    pub emergency: bool,
}

/// Stores conversation context and assembles token-bounded payloads.
pub struct ContextManager {
    config: ContextConfig,
    counter: TokenCounter,
    state: ContextState,
    conversation_turns: Vec<ConversationTurn>,
    code_snippets: Vec<CodeSnippet>,
    tool_results: Vec<StoredToolResult>,
    system_messages: Vec<(String, usize)>,
    current_turn_number: u64,
    prioritizer: SmartPrioritizer,
    correlator: CrossTurnCorrelator,
    proactive: Option<ProactiveGatherer>,
    proactive_cache: Option<(Value, usize)>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, counter: TokenCounter) -> Self {
        info!(
            max_llm_token_limit = config.max_llm_token_limit,
            target_recent_turns = config.target_recent_turns,
            target_code_snippets = config.target_code_snippets,
            target_tool_results = config.target_tool_results,
            backend = counter.backend_name(),
            "context manager configured"
        );
        Self {
            config,
            counter,
            state: ContextState::default(),
            conversation_turns: Vec::new(),
            code_snippets: Vec::new(),
            tool_results: Vec::new(),
            system_messages: Vec::new(),
            current_turn_number: 0,
            prioritizer: SmartPrioritizer::new(),
            correlator: CrossTurnCorrelator::new(),
            proactive: None,
            proactive_cache: None,
        }
    }

    pub fn with_proactive(mut self, gatherer: ProactiveGatherer) -> Self {
        self.proactive = Some(gatherer);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn state(&self) -> &ContextState {
        &self.state
    }

    pub fn snippet_count(&self) -> usize {
        self.code_snippets.len()
    }

    pub fn tool_result_count(&self) -> usize {
        self.tool_results.len()
    }

    pub fn current_turn_number(&self) -> u64 {
        self.current_turn_number
    }

    async fn count(&self, text: &str) -> usize {
        self.counter.count(text).await
    }

    pub async fn start_new_turn(&mut self, user_message: Option<&str>) -> u64 {
        self.current_turn_number += 1;
        let user_message_tokens = match user_message {
            Some(message) => self.count(message).await,
            None => 0,
        };
        self.conversation_turns.push(ConversationTurn {
            turn_number: self.current_turn_number,
            user_message: user_message.map(str::to_owned),
            agent_message: None,
            tool_calls: Vec::new(),
            user_message_tokens,
            agent_message_tokens: 0,
            tool_calls_tokens: 0,
        });
        self.current_turn_number
    }

    pub async fn update_agent_response(&mut self, turn_number: u64, agent_message: &str) {
        let tokens = self.count(agent_message).await;
        match self
            .conversation_turns
            .iter_mut()
            .find(|turn| turn.turn_number == turn_number)
        {
            Some(turn) => {
                turn.agent_message = Some(agent_message.to_string());
                turn.agent_message_tokens = tokens;
            }
            None => warn!(turn_number, "turn not found when updating agent response"),
        }
    }

    pub async fn add_turn_tool_call(&mut self, turn_number: u64, tool_name: &str, args: Value) {
        let call = json!({"tool_name": tool_name, "args": args});
        let tokens = self.count(&call.to_string()).await;
        match self
            .conversation_turns
            .iter_mut()
            .find(|turn| turn.turn_number == turn_number)
        {
            Some(turn) => {
                turn.tool_calls.push(call);
                turn.tool_calls_tokens += tokens;
            }
            None => warn!(turn_number, "turn not found when adding tool call"),
        }
    }

    pub async fn update_goal(&mut self, goal: &str) {
        self.state.core_goal = goal.to_string();
        self.state.core_goal_tokens = self.count(goal).await;
        info!(tokens = self.state.core_goal_tokens, "updated core goal");
    }

    pub async fn update_phase(&mut self, phase: &str) {
        self.state.current_phase = phase.to_string();
        self.state.current_phase_tokens = self.count(phase).await;
    }

    pub fn add_key_decision(&mut self, decision: &str) {
        if self.state.key_decisions.len() >= 15 {
            self.state.key_decisions.remove(0);
        }
        self.state.key_decisions.push(decision.to_string());
    }

    pub fn track_file_modification(&mut self, file_path: &str) {
        if self.state.last_modified_files.iter().any(|f| f == file_path) {
            return;
        }
        if self.state.last_modified_files.len() >= 15 {
            self.state.last_modified_files.remove(0);
        }
        self.state.last_modified_files.push(file_path.to_string());
    }

    pub async fn add_system_message(&mut self, message: &str) {
        let tokens = self.count(message).await;
        self.system_messages.push((message.to_string(), tokens));
        info!(tokens, "added system message");
    }

    /// Store a code snippet, deduplicating on (path, start, end): an
    /// existing snippet is refreshed rather than duplicated.
    pub async fn add_code_snippet(
        &mut self,
        file_path: &str,
        code: &str,
        start_line: usize,
        end_line: usize,
    ) {
        if let Some(existing) = self.code_snippets.iter_mut().find(|snippet| {
            snippet.file_path == file_path
                && snippet.start_line == start_line
                && snippet.end_line == end_line
        }) {
            existing.last_accessed = self.current_turn_number;
            existing.relevance_score += SNIPPET_REFRESH_BONUS;
            debug!(file_path, start_line, end_line, "refreshed existing code snippet");
            return;
        }

        let token_count = self.count(code).await;
        if self.code_snippets.len() >= self.config.max_stored_code_snippets {
            // Evict the least valuable snippet: lowest relevance, oldest access.
            self.code_snippets.sort_by(|a, b| {
                (a.relevance_score, a.last_accessed)
                    .partial_cmp(&(b.relevance_score, b.last_accessed))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let removed = self.code_snippets.remove(0);
            debug!(file = removed.file_path, "evicted code snippet at store limit");
        }
        self.code_snippets.push(CodeSnippet {
            file_path: file_path.to_string(),
            code: code.to_string(),
            start_line,
            end_line,
            last_accessed: self.current_turn_number,
            relevance_score: 1.0,
            token_count,
        });
    }

    /// Store full file content: small files as one snippet, larger files in
    /// fixed-size line chunks. The file is also tracked as modified.
    pub async fn add_full_file_content(&mut self, file_path: &str, content: &str) {
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= SINGLE_SNIPPET_LINES {
            self.add_code_snippet(file_path, content, 1, lines.len().max(1))
                .await;
        } else {
            let mut start = 0usize;
            while start < lines.len() {
                let end = (start + FILE_CHUNK_LINES).min(lines.len());
                let chunk = lines[start..end].join("\n");
                self.add_code_snippet(file_path, &chunk, start + 1, end).await;
                start = end;
            }
        }
        self.track_file_modification(file_path);
    }

    /// Record a tool result, generating a summary when none is supplied.
    pub async fn add_tool_result(
        &mut self,
        tool_name: &str,
        result: Value,
        summary: Option<String>,
    ) {
        let summary = match summary {
            Some(summary) => summary,
            None => summarizer::generate_summary(tool_name, &result, &self.config.summary_limits),
        };
        let is_error = summarizer::is_error_result(&result);
        let token_count = self.count(&summary).await;

        if self.tool_results.len() >= self.config.max_stored_tool_results {
            // FIFO by turn number.
            self.tool_results.sort_by_key(|result| result.turn_number);
            let removed = self.tool_results.remove(0);
            debug!(tool = removed.tool_name, "evicted tool result at store limit");
        }
        self.tool_results.push(StoredToolResult {
            tool_name: tool_name.to_string(),
            result_summary: summary,
            full_result: result,
            turn_number: self.current_turn_number,
            is_error,
            relevance_score: 1.0,
            token_count,
        });
    }

    /// Adjust inclusion targets; used by the retry optimizer's progressive
    /// shrinkage.
    pub fn set_targets(&mut self, recent_turns: usize, code_snippets: usize, tool_results: usize) {
        self.config.target_recent_turns = recent_turns;
        self.config.target_code_snippets = code_snippets;
        self.config.target_tool_results = tool_results;
    }

    /// Keep only the `keep` most relevant snippets in store.
    pub fn truncate_snippets(&mut self, keep: usize) {
        if self.code_snippets.len() > keep {
            self.code_snippets.truncate(keep);
        }
    }

    pub fn clear_snippets(&mut self) {
        self.code_snippets.clear();
    }

    pub fn clear_tool_results(&mut self) {
        self.tool_results.clear();
    }

    /// Clear goal, phase, decisions, and modified files. `keep_goal`
    /// preserves the goal text through a full reset.
    pub fn clear_scalar_state(&mut self, keep_goal: bool) {
        let goal = if keep_goal {
            Some((
                std::mem::take(&mut self.state.core_goal),
                self.state.core_goal_tokens,
            ))
        } else {
            None
        };
        self.state = ContextState::default();
        if let Some((goal, tokens)) = goal {
            self.state.core_goal = goal;
            self.state.core_goal_tokens = tokens;
        }
    }

    /// One-way sync: rebuild the conversation view from the state manager's
    /// snapshot at the start of an LLM request. Snippet and tool-result
    /// stores are context-manager-owned and survive the sync.
    pub async fn sync_from_state(&mut self, manager: &StateManager) {
        self.conversation_turns.clear();
        for turn in manager
            .history()
            .iter()
            .chain(manager.current_turn().into_iter())
        {
            let user_message_tokens = match &turn.user_message {
                Some(message) => self.count(message).await,
                None => 0,
            };
            let agent_message_tokens = match &turn.agent_message {
                Some(message) => self.count(message).await,
                None => 0,
            };
            let mut tool_calls = Vec::with_capacity(turn.tool_calls.len());
            let mut tool_calls_tokens = 0usize;
            for call in &turn.tool_calls {
                let value = json!({"tool_name": call.tool_name, "args": call.args});
                tool_calls_tokens += self.count(&value.to_string()).await;
                tool_calls.push(value);
            }
            self.conversation_turns.push(ConversationTurn {
                turn_number: turn.turn_number,
                user_message: turn.user_message.clone(),
                agent_message: turn.agent_message.clone(),
                tool_calls,
                user_message_tokens,
                agent_message_tokens,
                tool_calls_tokens,
            });
        }
        self.current_turn_number = self
            .conversation_turns
            .last()
            .map(|turn| turn.turn_number)
            .unwrap_or(0);

        let app = manager.app_state();
        if app.core_goal != self.state.core_goal {
            let goal = app.core_goal.clone();
            self.update_goal(&goal).await;
        }
        if app.current_phase != self.state.current_phase {
            let phase = app.current_phase.clone();
            self.update_phase(&phase).await;
        }
        self.state.key_decisions = app.key_decisions.clone();
        self.state.last_modified_files = app.last_modified_files.clone();
    }

    async fn gather_proactive(&mut self) -> Option<(Value, usize)> {
        if !self.config.enable_proactive_context {
            return None;
        }
        if self.proactive_cache.is_none() {
            let gatherer = self.proactive.as_ref()?;
            let context = gatherer.gather_all().await;
            if context.as_object().is_some_and(|map| map.is_empty()) {
                return None;
            }
            let tokens = self.count(&context.to_string()).await;
            info!(tokens, "gathered proactive context");
            self.proactive_cache = Some((context, tokens));
        }
        self.proactive_cache.clone()
    }

    /// Assemble the context mapping under the token budget left after
    /// `base_prompt_tokens`.
    pub async fn assemble_context(&mut self, base_prompt_tokens: usize) -> AssembledContext {
        let wrapper_tokens = self.count(&wrapper_text()).await;
        let available = self
            .config
            .max_llm_token_limit
            .saturating_sub(base_prompt_tokens)
            .saturating_sub(wrapper_tokens)
            .saturating_sub(SAFETY_MARGIN);

        debug!(
            max = self.config.max_llm_token_limit,
            base_prompt_tokens, wrapper_tokens, available, "context assembly budget"
        );

        if available == 0 {
            warn!("no token budget available for structured context, emergency minimal context");
            return AssembledContext {
                context: Map::new(),
                token_count: 0,
                emergency: true,
            };
        }

        let mut context = Map::new();
        let mut used = 0usize;

        // Core goal and phase first: cheapest, highest value.
        if !self.state.core_goal.is_empty() && used + self.state.core_goal_tokens <= available {
            context.insert("core_goal".into(), json!(self.state.core_goal));
            used += self.state.core_goal_tokens;
        }
        if !self.state.current_phase.is_empty()
            && used + self.state.current_phase_tokens <= available
        {
            context.insert("current_phase".into(), json!(self.state.current_phase));
            used += self.state.current_phase_tokens;
        }

        // System notes, newest first.
        if !self.system_messages.is_empty() {
            let mut notes = Vec::new();
            for (message, tokens) in self.system_messages.iter().rev() {
                if used + tokens <= available {
                    notes.push(message.clone());
                    used += tokens;
                } else {
                    break;
                }
            }
            if !notes.is_empty() {
                context.insert("system_notes".into(), json!(notes));
            }
        }

        // Conversation, newest first up to the target, then re-reversed so
        // the model reads chronological order.
        let turn_overhead = self
            .count(&json!({"turn": 0, "user": "", "agent": "", "tool_calls": []}).to_string())
            .await;
        let mut selected_turns = Vec::new();
        for turn in self.conversation_turns.iter().rev() {
            let turn_tokens = turn.total_tokens() + turn_overhead;
            if used + turn_tokens <= available
                && selected_turns.len() < self.config.target_recent_turns
            {
                selected_turns.push(json!({
                    "turn": turn.turn_number,
                    "user": turn.user_message,
                    "agent": turn.agent_message,
                    "tool_calls": turn.tool_calls,
                }));
                used += turn_tokens;
            } else {
                break;
            }
        }
        if !selected_turns.is_empty() {
            selected_turns.reverse();
            context.insert("recent_conversation".into(), json!(selected_turns));
        }

        // Current context string drives relevance ranking.
        let current_context = self
            .conversation_turns
            .last()
            .map(|turn| {
                format!(
                    "{} {}",
                    turn.user_message.as_deref().unwrap_or(""),
                    turn.agent_message.as_deref().unwrap_or("")
                )
            })
            .unwrap_or_default();

        let valid_snippets: Vec<CodeSnippet> = self
            .code_snippets
            .iter()
            .filter(|snippet| snippet.token_count > 0)
            .cloned()
            .collect();
        let prioritized_snippets = self.prioritizer.prioritize_code_snippets(
            valid_snippets,
            &current_context,
            self.current_turn_number,
        );
        let prioritized_results = self.prioritizer.prioritize_tool_results(
            self.tool_results.clone(),
            &current_context,
            self.current_turn_number,
        );
        let (ordered_snippets, ordered_results) = self.correlator.correlate_context_items(
            prioritized_snippets,
            prioritized_results,
            &self.conversation_turns,
        );

        let snippet_overhead = self
            .count(
                &json!({"file": "", "start_line": 0, "end_line": 0, "code": ""}).to_string(),
            )
            .await;
        let mut selected_snippets = Vec::new();
        for scored in &ordered_snippets {
            let snippet_tokens = scored.item.token_count + snippet_overhead;
            if used + snippet_tokens <= available
                && selected_snippets.len() < self.config.target_code_snippets
            {
                selected_snippets.push(json!({
                    "file": scored.item.file_path,
                    "start_line": scored.item.start_line,
                    "end_line": scored.item.end_line,
                    "code": scored.item.code,
                }));
                used += snippet_tokens;
            } else {
                break;
            }
        }
        if !selected_snippets.is_empty() {
            context.insert("relevant_code".into(), json!(selected_snippets));
        }

        let result_overhead = self
            .count(&json!({"tool": "", "turn": 0, "summary": "", "is_error": false}).to_string())
            .await;
        let mut selected_results = Vec::new();
        for scored in &ordered_results {
            let result_tokens = scored.item.token_count + result_overhead;
            if used + result_tokens <= available
                && selected_results.len() < self.config.target_tool_results
            {
                selected_results.push(json!({
                    "tool": scored.item.tool_name,
                    "turn": scored.item.turn_number,
                    "summary": scored.item.result_summary,
                    "is_error": scored.item.is_error,
                }));
                used += result_tokens;
            } else {
                break;
            }
        }
        if !selected_results.is_empty() {
            context.insert("recent_tool_results".into(), json!(selected_results));
        }

        // Key decisions: tail of up to 15, included as one unit.
        if !self.state.key_decisions.is_empty() {
            let tail: Vec<&String> = self.state.key_decisions.iter().rev().take(15).collect();
            let tail: Vec<&String> = tail.into_iter().rev().collect();
            let decisions_json = json!(tail);
            let decisions_tokens = self.count(&decisions_json.to_string()).await;
            if used + decisions_tokens <= available {
                context.insert("key_decisions".into(), decisions_json);
                used += decisions_tokens;
            }
        }

        if !self.state.last_modified_files.is_empty() {
            let files_json = json!(self.state.last_modified_files);
            let files_tokens = self.count(&files_json.to_string()).await;
            if used + files_tokens <= available {
                context.insert("recent_modified_files".into(), files_json);
                used += files_tokens;
            }
        }

        // Proactive context last: full if it fits, else partial by category.
        if let Some((proactive, proactive_tokens)) = self.gather_proactive().await {
            let remaining = available.saturating_sub(used);
            if proactive_tokens <= remaining {
                context.insert("proactive_context".into(), proactive);
                used += proactive_tokens;
            } else if remaining > PARTIAL_PROACTIVE_FLOOR {
                let mut partial = Map::new();
                let mut partial_tokens = 0usize;
                if let Some(map) = proactive.as_object() {
                    for category in PROACTIVE_PRIORITY {
                        let Some(value) = map.get(*category) else { continue };
                        let category_tokens = self.count(&value.to_string()).await;
                        if partial_tokens + category_tokens <= remaining {
                            partial.insert((*category).to_string(), value.clone());
                            partial_tokens += category_tokens;
                        }
                    }
                }
                if !partial.is_empty() {
                    used += partial_tokens;
                    context.insert("proactive_context".into(), Value::Object(partial));
                }
            }
        }

        // Emergency minimal path: nothing fit, but budget exists. Surface
        // at least the most recent user message so the model is never blind.
        let mut emergency = false;
        if context.is_empty() {
            if let Some(message) = self
                .conversation_turns
                .last()
                .and_then(|turn| turn.user_message.clone())
            {
                let clipped: String = message.chars().take(available.saturating_mul(3)).collect();
                let tokens = self.count(&clipped).await;
                if tokens <= available {
                    used += tokens;
                    context.insert("current_user_message".into(), json!(clipped));
                }
            }
            emergency = true;
            warn!("context assembly fell back to emergency minimal context");
        }

        info!(
            used,
            available,
            keys = ?context.keys().collect::<Vec<_>>(),
            "assembled context"
        );
        AssembledContext {
            context,
            token_count: used,
            emergency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use pretty_assertions::assert_eq;

    fn manager_with_limit(limit: usize) -> ContextManager {
        let config = ContextConfig {
            max_llm_token_limit: limit,
            enable_proactive_context: false,
            ..ContextConfig::default()
        };
        ContextManager::new(config, TokenCounter::heuristic("test-model"))
    }

    #[tokio::test]
    async fn snippet_store_respects_capacity() {
        let mut manager = manager_with_limit(100_000);
        manager.config.max_stored_code_snippets = 5;
        for i in 0..10 {
            manager
                .add_code_snippet(&format!("src/file{i}.rs"), "fn main() { let a = 1; }", 1, 3)
                .await;
        }
        assert_eq!(manager.snippet_count(), 5);
    }

    #[tokio::test]
    async fn duplicate_snippet_refreshes_instead_of_growing() {
        let mut manager = manager_with_limit(100_000);
        manager.start_new_turn(Some("look at auth")).await;
        manager
            .add_code_snippet("src/auth.rs", "fn login() {}", 1, 5)
            .await;
        manager.start_new_turn(Some("again")).await;
        manager
            .add_code_snippet("src/auth.rs", "fn login() {}", 1, 5)
            .await;

        assert_eq!(manager.snippet_count(), 1);
        let snippet = &manager.code_snippets[0];
        assert_eq!(snippet.last_accessed, 2);
        assert!(snippet.relevance_score > 1.0);
    }

    #[tokio::test]
    async fn tool_results_evict_oldest_turn_first() {
        let mut manager = manager_with_limit(100_000);
        manager.config.max_stored_tool_results = 3;
        for i in 0..5u64 {
            manager.start_new_turn(Some("msg")).await;
            manager
                .add_tool_result(&format!("tool{i}"), json!({"status": "ok"}), None)
                .await;
        }
        assert_eq!(manager.tool_result_count(), 3);
        assert!(manager.tool_results.iter().all(|r| r.turn_number >= 3));
    }

    #[tokio::test]
    async fn assembly_stays_within_budget() {
        let mut manager = manager_with_limit(2000);
        for i in 0..10 {
            manager
                .start_new_turn(Some(&format!("user message number {i} with some length to it")))
                .await;
            manager
                .update_agent_response(
                    manager.current_turn_number(),
                    &format!("agent reply number {i} that also has some length"),
                )
                .await;
        }
        manager.update_goal("ship the release").await;

        let base = 500;
        let assembled = manager.assemble_context(base).await;
        let wrapper = manager.count(&wrapper_text()).await;
        assert!(assembled.token_count + base + wrapper + SAFETY_MARGIN <= 2000);
        assert!(assembled.context.contains_key("core_goal"));
    }

    #[tokio::test]
    async fn tight_budget_keeps_most_recent_turn_and_scalars() {
        let mut manager = manager_with_limit(500);
        for i in 0..20 {
            manager
                .start_new_turn(Some(&format!(
                    "long user message {i} {}",
                    "filler words ".repeat(30)
                )))
                .await;
            manager
                .update_agent_response(
                    manager.current_turn_number(),
                    &format!("long agent reply {i} {}", "more filler ".repeat(30)),
                )
                .await;
        }

        let assembled = manager.assemble_context(100).await;
        let wrapper = manager.count(&wrapper_text()).await;
        assert!(assembled.token_count + 100 + wrapper + SAFETY_MARGIN <= 500);
        let turns = assembled
            .context
            .get("recent_conversation")
            .and_then(Value::as_array)
            .map(|turns| turns.len())
            .unwrap_or(0);
        assert!(turns <= 1);
    }

    #[tokio::test]
    async fn zero_budget_returns_empty_emergency_context() {
        let mut manager = manager_with_limit(100);
        manager.start_new_turn(Some("hello")).await;
        let assembled = manager.assemble_context(5000).await;
        assert!(assembled.emergency);
        assert!(assembled.context.is_empty());
        assert_eq!(assembled.token_count, 0);
    }

    #[tokio::test]
    async fn error_tool_results_are_packed_before_older_successes() {
        let mut manager = manager_with_limit(50_000);
        manager.start_new_turn(Some("deploy the service")).await;
        manager
            .add_tool_result("read_file", json!({"status": "success", "content": "ok"}), None)
            .await;
        manager
            .add_tool_result(
                "execute_shell",
                json!({"status": "error", "message": "exit 1"}),
                None,
            )
            .await;

        let assembled = manager.assemble_context(100).await;
        let results = assembled.context["recent_tool_results"].as_array().unwrap();
        assert_eq!(results[0]["tool"], "execute_shell");
        assert_eq!(results[0]["is_error"], true);
    }

    #[tokio::test]
    async fn set_targets_is_idempotent() {
        let mut manager = manager_with_limit(10_000);
        manager.set_targets(1, 0, 0);
        let first = (
            manager.config.target_recent_turns,
            manager.config.target_code_snippets,
            manager.config.target_tool_results,
        );
        manager.set_targets(1, 0, 0);
        let second = (
            manager.config.target_recent_turns,
            manager.config.target_code_snippets,
            manager.config.target_tool_results,
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn full_file_content_chunks_large_files() {
        let mut manager = manager_with_limit(100_000);
        manager.start_new_turn(Some("read it")).await;
        let content = (0..130)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        manager.add_full_file_content("src/big.rs", &content).await;
        assert_eq!(manager.snippet_count(), 3);
        assert_eq!(manager.code_snippets[0].start_line, 1);
        assert_eq!(manager.code_snippets[0].end_line, 50);
        assert_eq!(manager.code_snippets[2].start_line, 101);
        assert!(manager.state().last_modified_files.contains(&"src/big.rs".to_string()));
    }
}
