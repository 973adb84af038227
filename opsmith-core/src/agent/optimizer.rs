//! Progressive context shrinkage between retries.
//!
//! Each retry level is idempotent: re-applying a level yields the same
//! state, so a second failure at the same level cannot shrink differently.

use tracing::info;

use crate::context::ContextManager;
use crate::core::state::{StateManager, StateValidationError};

/// Apply the shrinkage level for retry attempt `level` (1-based).
///
/// - level 1: keep the last 2 turns and 3 code snippets;
/// - level 2: keep the last turn, drop all snippets, clear current-turn
///   tool results;
/// - level 3 and above: reset history to the current user message alone and
///   clear all scalar state (the goal survives when `keep_goal` is set).
pub fn apply_shrinkage(
    level: u32,
    state: &mut StateManager,
    context: &mut ContextManager,
    keep_goal: bool,
) -> Result<(), StateValidationError> {
    match level {
        0 => {}
        1 => {
            state.retain_recent_history(2);
            context.truncate_snippets(3);
            let (turns, snippets, results) = {
                let config = context.config();
                (
                    config.target_recent_turns.min(2),
                    config.target_code_snippets.min(3),
                    config.target_tool_results.min(3),
                )
            };
            context.set_targets(turns, snippets, results);
        }
        2 => {
            state.retain_recent_history(1);
            if let Some(turn) = state.current_turn_mut() {
                turn.tool_results.clear();
            }
            context.clear_snippets();
            context.set_targets(1, 0, 1);
        }
        _ => {
            let user_message = state
                .current_turn()
                .and_then(|turn| turn.user_message.clone());
            let goal = state.app_state().core_goal.clone();

            state.reset();
            state.start_turn(user_message.as_deref())?;
            if keep_goal {
                state.app_state_mut().core_goal = goal;
            }

            context.clear_snippets();
            context.clear_tool_results();
            context.clear_scalar_state(keep_goal);
            context.set_targets(1, 0, 0);
        }
    }
    info!(level, "applied retry context shrinkage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::core::token_counter::TokenCounter;

    async fn populated() -> (StateManager, ContextManager) {
        let mut state = StateManager::new();
        for i in 0..5 {
            state.start_turn(Some(&format!("message {i}"))).unwrap();
            state.complete_current_turn().unwrap();
        }
        state.start_turn(Some("current message")).unwrap();
        state
            .add_tool_result("read_file", serde_json::json!({"status": "success"}))
            .unwrap();
        state.app_state_mut().core_goal = "finish migration".into();

        let mut context = ContextManager::new(
            ContextConfig {
                enable_proactive_context: false,
                ..ContextConfig::default()
            },
            TokenCounter::heuristic("test-model"),
        );
        for i in 0..6 {
            context
                .add_code_snippet(&format!("src/f{i}.rs"), "fn x() {}", 1, 1)
                .await;
        }
        context.update_goal("finish migration").await;
        (state, context)
    }

    #[tokio::test]
    async fn level_one_keeps_two_turns_and_three_snippets() {
        let (mut state, mut context) = populated().await;
        apply_shrinkage(1, &mut state, &mut context, false).unwrap();
        assert_eq!(state.history().len(), 2);
        assert_eq!(context.snippet_count(), 3);
        assert_eq!(context.config().target_recent_turns, 2);
    }

    #[tokio::test]
    async fn level_two_clears_snippets_and_current_tool_results() {
        let (mut state, mut context) = populated().await;
        apply_shrinkage(2, &mut state, &mut context, false).unwrap();
        assert_eq!(state.history().len(), 1);
        assert_eq!(context.snippet_count(), 0);
        assert!(state.current_turn().unwrap().tool_results.is_empty());
    }

    #[tokio::test]
    async fn level_three_resets_to_user_message_only() {
        let (mut state, mut context) = populated().await;
        apply_shrinkage(3, &mut state, &mut context, false).unwrap();
        assert!(state.history().is_empty());
        let turn = state.current_turn().unwrap();
        assert_eq!(turn.turn_number, 1);
        assert_eq!(turn.user_message.as_deref(), Some("current message"));
        assert!(turn.tool_results.is_empty());
        assert!(state.app_state().core_goal.is_empty());
        assert!(context.state().core_goal.is_empty());
        assert_eq!(context.config().target_code_snippets, 0);
    }

    #[tokio::test]
    async fn level_three_can_preserve_the_goal() {
        let (mut state, mut context) = populated().await;
        apply_shrinkage(3, &mut state, &mut context, true).unwrap();
        assert_eq!(state.app_state().core_goal, "finish migration");
        assert_eq!(context.state().core_goal, "finish migration");
    }

    #[tokio::test]
    async fn each_level_is_idempotent() {
        for level in 1..=3u32 {
            let (mut state, mut context) = populated().await;
            apply_shrinkage(level, &mut state, &mut context, false).unwrap();
            let history_after = state.history().len();
            let snippets_after = context.snippet_count();
            let targets_after = (
                context.config().target_recent_turns,
                context.config().target_code_snippets,
                context.config().target_tool_results,
            );
            let current_user = state
                .current_turn()
                .and_then(|turn| turn.user_message.clone());

            apply_shrinkage(level, &mut state, &mut context, false).unwrap();
            assert_eq!(state.history().len(), history_after, "level {level}");
            assert_eq!(context.snippet_count(), snippets_after, "level {level}");
            assert_eq!(
                (
                    context.config().target_recent_turns,
                    context.config().target_code_snippets,
                    context.config().target_tool_results,
                ),
                targets_after,
                "level {level}"
            );
            assert_eq!(
                state
                    .current_turn()
                    .and_then(|turn| turn.user_message.clone()),
                current_user,
                "level {level}"
            );
        }
    }
}
