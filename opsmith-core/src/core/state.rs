//! Conversation turn state machine.
//!
//! A conversation is an ordered list of completed turns plus at most one
//! in-progress turn. Turns advance through [`TurnPhase`] in declaration
//! order; skipping forward is allowed, moving backward is not. The manager
//! enforces single-writer discipline with a boolean lock whose contention is
//! a hard error rather than a wait: the core is single-threaded per
//! conversation by contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::unix_now;

/// Phase of a conversation turn. Transitions are forward-only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Initializing,
    ProcessingUserInput,
    CallingLlm,
    ProcessingLlmResponse,
    ExecutingTools,
    Finalizing,
    Completed,
}

/// Raised when a state invariant is violated.
#[derive(Debug, thiserror::Error)]
pub enum StateValidationError {
    #[error("state is currently locked for modification")]
    Locked,
    #[error("no current turn to operate on")]
    NoCurrentTurn,
    #[error("invalid turn number: {0}")]
    InvalidTurnNumber(u64),
    #[error("turn {0} marked completed but no completion time")]
    MissingCompletionTime(u64),
    #[error("backward phase transition from {from:?} to {to:?} in turn {turn}")]
    BackwardTransition {
        turn: u64,
        from: TurnPhase,
        to: TurnPhase,
    },
    #[error("failed to sync from legacy state: {0}")]
    LegacySync(String),
}

/// A tool invocation recorded against a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub timestamp: f64,
}

/// A tool result recorded against a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_name: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub timestamp: f64,
}

/// A single user/agent exchange.
///
/// Mutable only while it is the current turn; once appended to history it
/// is read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub turn_number: u64,
    #[serde(default)]
    pub phase: TurnPhase,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub agent_message: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default)]
    pub system_messages: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub completed_at: Option<f64>,
}

impl Turn {
    fn new(turn_number: u64, user_message: Option<String>) -> Self {
        Self {
            turn_number,
            phase: TurnPhase::ProcessingUserInput,
            user_message,
            agent_message: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            system_messages: Vec::new(),
            errors: Vec::new(),
            created_at: unix_now(),
            completed_at: None,
        }
    }

    /// Mark the turn completed, stamping a completion time strictly after
    /// creation.
    pub fn mark_completed(&mut self) {
        self.phase = TurnPhase::Completed;
        let now = unix_now();
        self.completed_at = Some(if now > self.created_at {
            now
        } else {
            self.created_at + 1e-6
        });
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        warn!(turn = self.turn_number, %error, "turn error recorded");
        self.errors.push(error);
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<(), StateValidationError> {
        if self.turn_number < 1 {
            return Err(StateValidationError::InvalidTurnNumber(self.turn_number));
        }
        if self.phase == TurnPhase::Completed && self.completed_at.is_none() {
            return Err(StateValidationError::MissingCompletionTime(
                self.turn_number,
            ));
        }
        Ok(())
    }
}

/// In-place update for the current turn. Fields left `None` are untouched.
#[derive(Debug, Clone, Default)]
pub struct TurnUpdate {
    pub user_message: Option<String>,
    pub agent_message: Option<String>,
    pub phase: Option<TurnPhase>,
}

impl TurnUpdate {
    pub fn user_message(message: impl Into<String>) -> Self {
        Self {
            user_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn agent_message(message: impl Into<String>) -> Self {
        Self {
            agent_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Scalar conversation state shared with the context assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppState {
    pub code_snippets: Vec<Value>,
    pub core_goal: String,
    pub current_phase: String,
    pub key_decisions: Vec<String>,
    pub last_modified_files: Vec<String>,
}

const MAX_KEY_DECISIONS: usize = 15;
const MAX_MODIFIED_FILES: usize = 15;

impl AppState {
    pub fn add_key_decision(&mut self, decision: impl Into<String>) {
        if self.key_decisions.len() >= MAX_KEY_DECISIONS {
            self.key_decisions.remove(0);
        }
        self.key_decisions.push(decision.into());
    }

    pub fn track_modified_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if self.last_modified_files.contains(&path) {
            return;
        }
        if self.last_modified_files.len() >= MAX_MODIFIED_FILES {
            self.last_modified_files.remove(0);
        }
        self.last_modified_files.push(path);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// External key-value representation used when the core is embedded in a
/// host that persists state itself. Keys use `user:`, `temp:`, and `app:`
/// prefixes.
pub type LegacyState = Map<String, Value>;

/// Owns the conversation state and enforces turn invariants.
#[derive(Debug, Default)]
pub struct StateManager {
    history: Vec<Turn>,
    current: Option<Turn>,
    is_new_conversation: bool,
    app_state: AppState,
    lock: bool,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            current: None,
            is_new_conversation: true,
            app_state: AppState::default(),
            lock: false,
        }
    }

    fn acquire_lock(&mut self) -> Result<(), StateValidationError> {
        if self.lock {
            return Err(StateValidationError::Locked);
        }
        self.lock = true;
        Ok(())
    }

    fn release_lock(&mut self) {
        self.lock = false;
    }

    /// Start a new turn and return its number. An unfinished previous turn
    /// is force-completed first with a warning.
    pub fn start_turn(&mut self, user_message: Option<&str>) -> Result<u64, StateValidationError> {
        self.acquire_lock()?;

        if let Some(mut previous) = self.current.take() {
            if previous.phase != TurnPhase::Completed {
                warn!(
                    turn = previous.turn_number,
                    "previous turn was not properly completed, completing now"
                );
                previous.mark_completed();
            }
            self.history.push(previous);
        }

        let turn_number = self.history.len() as u64 + 1;
        self.current = Some(Turn::new(turn_number, user_message.map(str::to_owned)));
        self.is_new_conversation = false;
        info!(turn = turn_number, "started new turn");

        self.release_lock();
        Ok(turn_number)
    }

    /// Apply an in-place update to the current turn.
    pub fn update_current_turn(&mut self, update: TurnUpdate) -> Result<(), StateValidationError> {
        self.acquire_lock()?;
        let result = match self.current.as_mut() {
            None => Err(StateValidationError::NoCurrentTurn),
            Some(turn) => {
                if let Some(message) = update.user_message {
                    turn.user_message = Some(message);
                }
                if let Some(message) = update.agent_message {
                    turn.agent_message = Some(message);
                }
                match update.phase {
                    Some(phase) if phase < turn.phase => Err(StateValidationError::BackwardTransition {
                        turn: turn.turn_number,
                        from: turn.phase,
                        to: phase,
                    }),
                    Some(phase) => {
                        turn.phase = phase;
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        };
        self.release_lock();
        result
    }

    /// Advance the current turn's phase. Forward-only.
    pub fn advance_phase(&mut self, phase: TurnPhase) -> Result<(), StateValidationError> {
        self.update_current_turn(TurnUpdate {
            phase: Some(phase),
            ..Default::default()
        })
    }

    pub fn add_tool_call(
        &mut self,
        tool_name: &str,
        args: Value,
    ) -> Result<(), StateValidationError> {
        let turn = self
            .current
            .as_mut()
            .ok_or(StateValidationError::NoCurrentTurn)?;
        turn.tool_calls.push(ToolCallRecord {
            tool_name: tool_name.to_string(),
            args,
            timestamp: unix_now(),
        });
        debug!(tool = tool_name, turn = turn.turn_number, "added tool call");
        Ok(())
    }

    pub fn add_tool_result(
        &mut self,
        tool_name: &str,
        result: Value,
    ) -> Result<(), StateValidationError> {
        let turn = self
            .current
            .as_mut()
            .ok_or(StateValidationError::NoCurrentTurn)?;
        turn.tool_results.push(ToolResultRecord {
            tool_name: tool_name.to_string(),
            result,
            timestamp: unix_now(),
        });
        debug!(
            tool = tool_name,
            turn = turn.turn_number,
            "added tool result"
        );
        Ok(())
    }

    /// Record a system message injected mid-turn (e.g. an approved plan).
    pub fn add_system_message(
        &mut self,
        message: impl Into<String>,
    ) -> Result<(), StateValidationError> {
        let turn = self
            .current
            .as_mut()
            .ok_or(StateValidationError::NoCurrentTurn)?;
        turn.system_messages.push(message.into());
        Ok(())
    }

    /// Record an error against the current turn. A no-op when no turn is
    /// active, so late failures never panic the error path itself.
    pub fn record_error(&mut self, error: impl Into<String>) {
        if let Some(turn) = self.current.as_mut() {
            turn.add_error(error);
        }
    }

    /// Complete the current turn, validate it, and move it to history.
    pub fn complete_current_turn(&mut self) -> Result<(), StateValidationError> {
        if self.current.is_none() {
            warn!("no current turn to complete");
            return Ok(());
        }
        self.acquire_lock()?;
        let result = (|| {
            let mut turn = self
                .current
                .take()
                .ok_or(StateValidationError::NoCurrentTurn)?;
            turn.mark_completed();
            turn.validate()?;
            info!(turn = turn.turn_number, "completed turn");
            self.history.push(turn);
            Ok(())
        })();
        self.release_lock();
        result
    }

    pub fn current_turn(&self) -> Option<&Turn> {
        self.current.as_ref()
    }

    pub(crate) fn current_turn_mut(&mut self) -> Option<&mut Turn> {
        self.current.as_mut()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn is_new_conversation(&self) -> bool {
        self.is_new_conversation
    }

    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    pub fn app_state_mut(&mut self) -> &mut AppState {
        &mut self.app_state
    }

    /// Drop all but the most recent `keep` completed turns. Used by the
    /// retry optimizer's progressive shrinkage.
    pub(crate) fn retain_recent_history(&mut self, keep: usize) {
        if self.history.len() > keep {
            let drop = self.history.len() - keep;
            self.history.drain(..drop);
        }
    }

    /// Reset to a brand-new conversation, keeping nothing.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Deep read-only view in the external key-value representation.
    pub fn snapshot_for_context(&self) -> LegacyState {
        let mut legacy_history: Vec<Value> = self
            .history
            .iter()
            .map(|turn| serde_json::to_value(turn).unwrap_or_else(|_| json!({})))
            .collect();
        if let Some(current) = &self.current {
            legacy_history.push(serde_json::to_value(current).unwrap_or_else(|_| json!({})));
        }

        let mut state = Map::new();
        state.insert("user:conversation_history".into(), Value::Array(legacy_history));
        state.insert(
            "temp:is_new_conversation".into(),
            Value::Bool(self.is_new_conversation),
        );
        state.insert(
            "temp:current_turn".into(),
            self.current
                .as_ref()
                .and_then(|turn| serde_json::to_value(turn).ok())
                .unwrap_or_else(|| json!({})),
        );
        state.insert(
            "app:code_snippets".into(),
            Value::Array(self.app_state.code_snippets.clone()),
        );
        state.insert(
            "app:core_goal".into(),
            Value::String(self.app_state.core_goal.clone()),
        );
        state.insert(
            "app:current_phase".into(),
            Value::String(self.app_state.current_phase.clone()),
        );
        state.insert(
            "app:key_decisions".into(),
            json!(self.app_state.key_decisions),
        );
        state.insert(
            "app:last_modified_files".into(),
            json!(self.app_state.last_modified_files),
        );
        state
    }

    /// Rebuild internal state from the external key-value representation.
    pub fn sync_from_legacy_state(
        &mut self,
        state: &LegacyState,
    ) -> Result<(), StateValidationError> {
        let history = state
            .get("user:conversation_history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let current_turn_value = state.get("temp:current_turn").cloned();
        let has_current = current_turn_value
            .as_ref()
            .map(|value| value.as_object().is_some_and(|map| !map.is_empty()))
            .unwrap_or(false);

        self.history = Vec::with_capacity(history.len());
        self.current = None;

        // The trailing history entry mirrors the current turn when one is
        // active; skip it so the turn is not duplicated.
        let completed_len = if has_current && !history.is_empty() {
            history.len() - 1
        } else {
            history.len()
        };

        for (index, turn_value) in history.iter().take(completed_len).enumerate() {
            let mut turn: Turn = serde_json::from_value(turn_value.clone())
                .map_err(|error| StateValidationError::LegacySync(error.to_string()))?;
            turn.turn_number = index as u64 + 1;
            turn.phase = TurnPhase::Completed;
            if turn.created_at == 0.0 {
                turn.created_at = unix_now();
            }
            if turn.completed_at.is_none() {
                turn.mark_completed();
            }
            self.history.push(turn);
        }

        if has_current {
            let value = current_turn_value.unwrap_or_else(|| json!({}));
            let mut turn: Turn = serde_json::from_value(value)
                .map_err(|error| StateValidationError::LegacySync(error.to_string()))?;
            turn.turn_number = self.history.len() as u64 + 1;
            if turn.phase == TurnPhase::Initializing {
                turn.phase = TurnPhase::ProcessingUserInput;
            }
            if turn.created_at == 0.0 {
                turn.created_at = unix_now();
            }
            self.current = Some(turn);
        }

        self.app_state.code_snippets = state
            .get("app:code_snippets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.app_state.core_goal = state
            .get("app:core_goal")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.app_state.current_phase = state
            .get("app:current_phase")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.app_state.key_decisions = string_list(state.get("app:key_decisions"));
        self.app_state.last_modified_files = string_list(state.get("app:last_modified_files"));

        self.is_new_conversation = state
            .get("temp:is_new_conversation")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        debug!(
            history = self.history.len(),
            has_current = self.current.is_some(),
            "synced state from legacy representation"
        );
        Ok(())
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn turn_numbers_are_dense() {
        let mut manager = StateManager::new();
        for i in 1..=4u64 {
            let turn_number = manager.start_turn(Some("hello")).unwrap();
            assert_eq!(turn_number, i);
            manager.complete_current_turn().unwrap();
        }
        for (index, turn) in manager.history().iter().enumerate() {
            assert_eq!(turn.turn_number, index as u64 + 1);
            assert_eq!(turn.phase, TurnPhase::Completed);
            assert!(turn.completed_at.unwrap() > turn.created_at);
        }
    }

    #[test]
    fn unfinished_turn_is_force_completed_on_next_start() {
        let mut manager = StateManager::new();
        manager.start_turn(Some("first")).unwrap();
        manager.start_turn(Some("second")).unwrap();
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.history()[0].phase, TurnPhase::Completed);
        assert_eq!(manager.current_turn().unwrap().turn_number, 2);
    }

    #[test]
    fn backward_phase_transition_is_rejected() {
        let mut manager = StateManager::new();
        manager.start_turn(Some("hi")).unwrap();
        manager.advance_phase(TurnPhase::ExecutingTools).unwrap();
        let error = manager.advance_phase(TurnPhase::CallingLlm).unwrap_err();
        assert!(matches!(
            error,
            StateValidationError::BackwardTransition { .. }
        ));
    }

    #[test]
    fn forward_skip_to_completed_is_allowed() {
        let mut manager = StateManager::new();
        manager.start_turn(Some("trivial")).unwrap();
        manager.advance_phase(TurnPhase::Completed).unwrap();
    }

    #[test]
    fn tool_calls_require_a_current_turn() {
        let mut manager = StateManager::new();
        let error = manager
            .add_tool_call("read_file", json!({"file_path": "a.txt"}))
            .unwrap_err();
        assert!(matches!(error, StateValidationError::NoCurrentTurn));
    }

    #[test]
    fn legacy_round_trip_preserves_state() {
        let mut manager = StateManager::new();
        manager.start_turn(Some("analyze the repo")).unwrap();
        manager
            .add_tool_call("read_file", json!({"file_path": "src/lib.rs"}))
            .unwrap();
        manager
            .add_tool_result("read_file", json!({"status": "success"}))
            .unwrap();
        manager
            .update_current_turn(TurnUpdate::agent_message("done"))
            .unwrap();
        manager.complete_current_turn().unwrap();
        manager.start_turn(Some("now fix the bug")).unwrap();
        manager.app_state_mut().core_goal = "fix the bug".into();
        manager.app_state_mut().add_key_decision("use serde");
        manager.app_state_mut().track_modified_file("src/lib.rs");

        let snapshot = manager.snapshot_for_context();
        let mut restored = StateManager::new();
        restored.sync_from_legacy_state(&snapshot).unwrap();

        assert_eq!(restored.history().len(), manager.history().len());
        assert_eq!(restored.history()[0], manager.history()[0]);
        assert_eq!(
            restored.current_turn().unwrap().user_message,
            manager.current_turn().unwrap().user_message
        );
        assert_eq!(restored.app_state(), manager.app_state());
        assert_eq!(
            restored.is_new_conversation(),
            manager.is_new_conversation()
        );

        // A second round trip is a fixed point.
        let second = restored.snapshot_for_context();
        assert_eq!(snapshot, second);
    }

    #[test]
    fn key_decisions_are_capped_at_fifteen() {
        let mut state = AppState::default();
        for i in 0..30 {
            state.add_key_decision(format!("decision {i}"));
        }
        assert_eq!(state.key_decisions.len(), 15);
        assert_eq!(state.key_decisions[0], "decision 15");
    }

    #[test]
    fn modified_files_dedup_and_cap() {
        let mut state = AppState::default();
        for i in 0..20 {
            state.track_modified_file(format!("file{i}.rs"));
        }
        state.track_modified_file("file19.rs");
        assert_eq!(state.last_modified_files.len(), 15);
    }
}
