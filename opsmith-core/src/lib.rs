//! # opsmith-core - Runtime for opsmith
//!
//! `opsmith-core` powers the opsmith interactive coding/DevOps agent. It
//! provides the turn-oriented execution engine that drives an LLM through
//! multi-turn conversations with tool use:
//!
//! - **Turn state machine**: per-turn lifecycle with invariant-preserving
//!   transitions and single-writer discipline (`core::state`).
//! - **Context assembler**: priority- and token-budget-driven packing of
//!   conversation history, code snippets, tool summaries, and proactive
//!   repository context (`context`).
//! - **Interactive planning**: a sub-protocol that diverts complex requests
//!   into plan generation and explicit approval (`planning`).
//! - **Tool orchestration**: dependency-aware execution with classified
//!   error recovery (`tools`).
//! - **Run loop**: an async event stream with retry, backoff, progressive
//!   context shrinkage, and circuit breakers (`agent`).
//!
//! The LLM transport, embedding store, and terminal rendering are
//! replaceable collaborators behind narrow traits (`llm::LlmProvider`,
//! `rag::CodeRetriever`).

pub mod agent;
pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod planning;
pub mod rag;
pub mod tools;

pub use self::agent::events::AgentEvent;
pub use self::agent::runloop::Agent;
pub use self::config::AgentConfig;
pub use self::core::state::{StateManager, Turn, TurnPhase};
pub use self::core::token_counter::TokenCounter;
pub use self::llm::provider::LlmProvider;
pub use self::planning::PlanningManager;
pub use self::tools::registry::{Tool, ToolContext, ToolRegistry};
