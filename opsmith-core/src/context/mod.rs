//! Context storage and token-budgeted assembly.
//!
//! The [`ContextManager`] stores conversation turns, code snippets,
//! tool-result summaries, and scalar goal/phase state, and on demand packs
//! them into a JSON mapping whose serialized token count stays within the
//! budget left over after the base prompt.

pub mod correlator;
pub mod manager;
pub mod prioritizer;
pub mod proactive;
pub mod summarizer;
pub mod types;

pub use correlator::CrossTurnCorrelator;
pub use manager::{AssembledContext, ContextManager};
pub use prioritizer::{RelevanceScore, Scored, SmartPrioritizer};
pub use proactive::ProactiveGatherer;
pub use types::{CodeSnippet, ContextState, ConversationTurn, StoredToolResult};
