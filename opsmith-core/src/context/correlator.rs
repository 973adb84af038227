//! Cross-turn correlation of context items.
//!
//! A secondary ranking pass after the prioritizer: items that reinforce one
//! another (same files, canonical tool sequences, adjacent turns) are
//! nudged forward so the assembled context hangs together instead of being
//! a bag of individually-relevant fragments.

use std::path::Path;

use super::prioritizer::Scored;
use super::types::{CodeSnippet, ConversationTurn, StoredToolResult};

/// Exact file-path match.
const FILE_EXACT: f64 = 1.0;
/// Same parent directory.
const FILE_SAME_DIR: f64 = 0.7;
/// Same extension.
const FILE_SAME_EXT: f64 = 0.4;

/// Same turn.
const SAME_TURN: f64 = 1.0;
/// Immediately adjacent turn.
const ADJACENT_TURN: f64 = 0.6;

/// Canonical tool sequences that commonly belong together.
const TOOL_SEQUENCES: &[(&str, &str)] = &[
    ("read_file", "edit_file"),
    ("edit_file", "execute_shell"),
    ("code_search", "read_file"),
    ("index_directory", "retrieve_code_context"),
];

/// Annotates scored items with correlation, then re-sorts by the combined
/// key.
#[derive(Debug, Default)]
pub struct CrossTurnCorrelator;

impl CrossTurnCorrelator {
    pub fn new() -> Self {
        Self
    }

    pub fn correlate_context_items(
        &self,
        mut snippets: Vec<Scored<CodeSnippet>>,
        mut tool_results: Vec<Scored<StoredToolResult>>,
        conversation: &[ConversationTurn],
    ) -> (Vec<Scored<CodeSnippet>>, Vec<Scored<StoredToolResult>>) {
        let snippet_files: Vec<String> = snippets
            .iter()
            .map(|scored| scored.item.file_path.clone())
            .collect();
        let current_turn = conversation.last().map(|turn| turn.turn_number).unwrap_or(0);

        for scored in &mut snippets {
            let file_similarity =
                best_file_similarity(&scored.item.file_path, &snippet_files, true);
            let temporal = temporal_proximity(scored.item.last_accessed, current_turn);
            scored.correlation = 0.6 * file_similarity + 0.4 * temporal;
        }

        let tool_names: Vec<(String, u64)> = tool_results
            .iter()
            .map(|scored| (scored.item.tool_name.clone(), scored.item.turn_number))
            .collect();

        for scored in &mut tool_results {
            let sequence = tool_sequence_score(
                &scored.item.tool_name,
                scored.item.turn_number,
                &tool_names,
            );
            let temporal = temporal_proximity(scored.item.turn_number, current_turn);
            scored.correlation = 0.6 * sequence + 0.4 * temporal;
        }

        sort_by_combined(&mut snippets);
        sort_by_combined(&mut tool_results);
        (snippets, tool_results)
    }
}

fn sort_by_combined<T>(items: &mut [Scored<T>]) {
    items.sort_by(|a, b| {
        b.combined_score()
            .partial_cmp(&a.combined_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Highest similarity between `path` and any *other* in-context file.
fn best_file_similarity(path: &str, files: &[String], skip_self_once: bool) -> f64 {
    let mut best = 0.0f64;
    let mut skipped_self = !skip_self_once;
    for other in files {
        if other == path && !skipped_self {
            skipped_self = true;
            continue;
        }
        best = best.max(file_similarity(path, other));
        if best >= FILE_EXACT {
            break;
        }
    }
    best
}

fn file_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return FILE_EXACT;
    }
    let (a_path, b_path) = (Path::new(a), Path::new(b));
    if a_path.parent().is_some() && a_path.parent() == b_path.parent() {
        return FILE_SAME_DIR;
    }
    if a_path.extension().is_some() && a_path.extension() == b_path.extension() {
        return FILE_SAME_EXT;
    }
    0.0
}

/// Score canonical pairings of this tool against other recorded
/// invocations in the same or adjacent turns.
fn tool_sequence_score(tool: &str, turn: u64, all: &[(String, u64)]) -> f64 {
    let mut best = 0.0f64;
    for (other_tool, other_turn) in all {
        if other_tool == tool && *other_turn == turn {
            continue;
        }
        let paired = TOOL_SEQUENCES.iter().any(|(first, second)| {
            (tool == *first && other_tool == second) || (tool == *second && other_tool == first)
        });
        if paired {
            let distance = turn.abs_diff(*other_turn);
            best = best.max(match distance {
                0 => SAME_TURN,
                1 => ADJACENT_TURN,
                _ => 0.3,
            });
        }
    }
    best
}

fn temporal_proximity(item_turn: u64, current_turn: u64) -> f64 {
    match current_turn.abs_diff(item_turn) {
        0 => SAME_TURN,
        1 => ADJACENT_TURN,
        distance => 1.0 / (1.0 + 0.3 * distance as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_similarity_tiers() {
        assert_eq!(file_similarity("src/auth.rs", "src/auth.rs"), FILE_EXACT);
        assert_eq!(file_similarity("src/auth.rs", "src/db.rs"), FILE_SAME_DIR);
        assert_eq!(file_similarity("src/auth.rs", "lib/util.rs"), FILE_SAME_EXT);
        assert_eq!(file_similarity("src/auth.rs", "docs/guide.md"), 0.0);
    }

    #[test]
    fn canonical_sequences_correlate() {
        let all = vec![
            ("read_file".to_string(), 3u64),
            ("edit_file".to_string(), 3u64),
        ];
        assert_eq!(tool_sequence_score("read_file", 3, &all), SAME_TURN);
        assert_eq!(tool_sequence_score("edit_file", 3, &all), SAME_TURN);

        let spread = vec![
            ("read_file".to_string(), 2u64),
            ("edit_file".to_string(), 3u64),
        ];
        assert_eq!(tool_sequence_score("edit_file", 3, &spread), ADJACENT_TURN);
    }

    #[test]
    fn unrelated_tools_do_not_correlate() {
        let all = vec![("list_dir".to_string(), 3u64)];
        assert_eq!(tool_sequence_score("execute_shell", 3, &all), 0.0);
    }

    #[test]
    fn temporal_proximity_decays() {
        assert_eq!(temporal_proximity(5, 5), SAME_TURN);
        assert_eq!(temporal_proximity(4, 5), ADJACENT_TURN);
        assert!(temporal_proximity(1, 5) < ADJACENT_TURN);
    }
}
