//! Relevance scoring for context items.
//!
//! Before packing, code snippets and tool results are reordered by a convex
//! combination of error priority, content relevance to the current request,
//! and recency. Error-flagged tool results always float to the front so the
//! model sees what just went wrong.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::{CodeSnippet, StoredToolResult};

/// Weight of the error component in the final score.
const ERROR_WEIGHT: f64 = 0.5;
/// Weight of content relevance.
const CONTENT_WEIGHT: f64 = 0.3;
/// Weight of recency.
const RECENCY_WEIGHT: f64 = 0.2;

/// Recency decay per turn of age; a five-turn-old item scores about 0.5.
const RECENCY_DECAY: f64 = 0.2;

/// Bonus per matched multi-word phrase, capped at the relevance ceiling.
const PHRASE_BONUS: f64 = 0.15;

/// Score attached to a context item during prioritization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RelevanceScore {
    pub content_relevance: f64,
    pub recency_score: f64,
    pub error_priority: f64,
    pub final_score: f64,
}

/// An item plus its computed score.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub score: RelevanceScore,
    /// Secondary correlation bias filled in by the correlator.
    pub correlation: f64,
}

impl<T> Scored<T> {
    /// Ranking key after correlation: the correlator biases, the
    /// prioritizer decides.
    pub fn combined_score(&self) -> f64 {
        self.score.final_score * 0.8 + self.correlation * 0.2
    }
}

/// Facts the prioritizer needs from an item.
pub trait Prioritizable {
    /// Textual payload used for keyword overlap.
    fn payload(&self) -> &str;
    /// Turn the item was produced or last touched in.
    fn turn(&self) -> u64;
    /// Whether the item is an error-flagged tool result.
    fn is_error(&self) -> bool;
}

impl Prioritizable for CodeSnippet {
    fn payload(&self) -> &str {
        &self.code
    }

    fn turn(&self) -> u64 {
        self.last_accessed
    }

    fn is_error(&self) -> bool {
        false
    }
}

impl Prioritizable for StoredToolResult {
    fn payload(&self) -> &str {
        &self.result_summary
    }

    fn turn(&self) -> u64 {
        self.turn_number
    }

    fn is_error(&self) -> bool {
        self.is_error
    }
}

/// Scores and reorders context items for inclusion.
#[derive(Debug, Default)]
pub struct SmartPrioritizer;

impl SmartPrioritizer {
    pub fn new() -> Self {
        Self
    }

    pub fn prioritize_code_snippets(
        &self,
        snippets: Vec<CodeSnippet>,
        current_context: &str,
        current_turn: u64,
    ) -> Vec<Scored<CodeSnippet>> {
        self.prioritize(snippets, current_context, current_turn)
    }

    pub fn prioritize_tool_results(
        &self,
        results: Vec<StoredToolResult>,
        current_context: &str,
        current_turn: u64,
    ) -> Vec<Scored<StoredToolResult>> {
        self.prioritize(results, current_context, current_turn)
    }

    fn prioritize<T: Prioritizable>(
        &self,
        items: Vec<T>,
        current_context: &str,
        current_turn: u64,
    ) -> Vec<Scored<T>> {
        let context_words = keyword_set(current_context);
        let context_phrases = phrase_list(current_context);

        let mut scored: Vec<Scored<T>> = items
            .into_iter()
            .map(|item| {
                let content_relevance =
                    content_relevance(item.payload(), &context_words, &context_phrases);
                let recency_score = recency_score(current_turn, item.turn());
                let error_priority = if item.is_error() { 1.0 } else { 0.0 };
                let final_score = ERROR_WEIGHT * error_priority
                    + CONTENT_WEIGHT * content_relevance
                    + RECENCY_WEIGHT * recency_score;
                Scored {
                    item,
                    score: RelevanceScore {
                        content_relevance,
                        recency_score,
                        error_priority,
                        final_score,
                    },
                    correlation: 0.0,
                }
            })
            .collect();

        // Descending by final score; recency breaks ties.
        scored.sort_by(|a, b| {
            (b.score.final_score, b.score.recency_score)
                .partial_cmp(&(a.score.final_score, a.score.recency_score))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }
}

/// `1 / (1 + decay * age)`, clamped to [0, 1].
fn recency_score(current_turn: u64, item_turn: u64) -> f64 {
    let age = current_turn.saturating_sub(item_turn) as f64;
    1.0 / (1.0 + RECENCY_DECAY * age)
}

fn content_relevance(payload: &str, context_words: &HashSet<String>, phrases: &[String]) -> f64 {
    if context_words.is_empty() {
        return 0.0;
    }

    let payload_lower = payload.to_lowercase();
    let payload_words = keyword_set(&payload_lower);
    let overlap = context_words
        .iter()
        .filter(|word| payload_words.contains(*word))
        .count();
    let mut relevance = overlap as f64 / context_words.len() as f64;

    // Multi-word phrase matches carry more signal than single tokens.
    for phrase in phrases {
        if payload_lower.contains(phrase.as_str()) {
            relevance += PHRASE_BONUS;
        }
    }

    relevance.clamp(0.0, 1.0)
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| word.len() >= 3)
        .map(str::to_owned)
        .collect()
}

fn phrase_list(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .to_lowercase()
        .split_whitespace()
        .filter(|word| word.len() >= 3)
        .map(str::to_owned)
        .collect();
    words
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snippet(path: &str, code: &str, turn: u64) -> CodeSnippet {
        CodeSnippet {
            file_path: path.to_string(),
            code: code.to_string(),
            start_line: 1,
            end_line: 10,
            last_accessed: turn,
            relevance_score: 1.0,
            token_count: 10,
        }
    }

    fn tool_result(name: &str, summary: &str, turn: u64, is_error: bool) -> StoredToolResult {
        StoredToolResult {
            tool_name: name.to_string(),
            result_summary: summary.to_string(),
            full_result: json!({}),
            turn_number: turn,
            is_error,
            relevance_score: 1.0,
            token_count: 5,
        }
    }

    #[test]
    fn five_turn_old_items_score_about_half_on_recency() {
        let score = recency_score(10, 5);
        assert!((score - 0.5).abs() < 0.01);
    }

    #[test]
    fn relevant_snippets_rank_above_stale_ones() {
        let prioritizer = SmartPrioritizer::new();
        let scored = prioritizer.prioritize_code_snippets(
            vec![
                snippet("src/db.rs", "fn connect_database() {}", 1),
                snippet("src/auth.rs", "fn authenticate_user(token: &str) {}", 9),
            ],
            "fix the authenticate_user token validation",
            10,
        );
        assert_eq!(scored[0].item.file_path, "src/auth.rs");
        assert!(scored[0].score.content_relevance > scored[1].score.content_relevance);
    }

    #[test]
    fn error_results_rank_first_regardless_of_relevance() {
        let prioritizer = SmartPrioritizer::new();
        let scored = prioritizer.prioritize_tool_results(
            vec![
                tool_result("read_file", "read the deployment manifest", 10, false),
                tool_result("execute_shell", "command exploded", 2, true),
            ],
            "deployment manifest",
            10,
        );
        assert_eq!(scored[0].item.tool_name, "execute_shell");
        assert_eq!(scored[0].score.error_priority, 1.0);
    }

    #[test]
    fn ties_break_by_recency() {
        let prioritizer = SmartPrioritizer::new();
        let scored = prioritizer.prioritize_tool_results(
            vec![
                tool_result("a", "unrelated", 2, false),
                tool_result("b", "unrelated", 9, false),
            ],
            "completely different topic words",
            10,
        );
        assert_eq!(scored[0].item.tool_name, "b");
    }
}
