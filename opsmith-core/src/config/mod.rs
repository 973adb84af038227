//! Configuration for the agent core.
//!
//! Everything is driven by `opsmith.toml`; each section deserializes with
//! the documented defaults so a missing file or key never blocks startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub context: ContextConfig,
    pub planning: PlanningConfig,
    pub run_loop: RunLoopConfig,
    pub tools: ToolsConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Model identifier handed to the transport.
    pub model: String,
    /// Display name used in logs and error messages.
    pub name: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            name: "opsmith".to_string(),
        }
    }
}

/// Per-tool-kind truncation limits for tool-result summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryLimits {
    /// Total cap on a generated summary.
    pub max_summary_len: usize,
    /// Head/tail window for file-read summaries.
    pub file_window: usize,
    /// Per-key cap when condensing generic dict results.
    pub important_key: usize,
    /// Cap for stringified fallback results.
    pub generic: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_summary_len: 2000,
            file_window: 500,
            important_key: 300,
            generic: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Upper bound for prompt tokens per LLM call.
    pub max_llm_token_limit: usize,
    /// Cap on conversation turns included per assembly.
    pub target_recent_turns: usize,
    /// Cap on code snippets included per assembly.
    pub target_code_snippets: usize,
    /// Cap on tool-result summaries included per assembly.
    pub target_tool_results: usize,
    /// Stored-snippet bound before eviction.
    pub max_stored_code_snippets: usize,
    /// Stored-tool-result bound before eviction.
    pub max_stored_tool_results: usize,
    pub summary_limits: SummaryLimits,
    /// Keep `core_goal` through a full (level >= 3) retry reset.
    pub keep_goal_on_full_reset: bool,
    /// Enable the proactive repository-context gatherer.
    pub enable_proactive_context: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_llm_token_limit: 128_000,
            target_recent_turns: 20,
            target_code_snippets: 25,
            target_tool_results: 30,
            max_stored_code_snippets: 100,
            max_stored_tool_results: 150,
            summary_limits: SummaryLimits::default(),
            keep_goal_on_full_reset: false,
            enable_proactive_context: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Master switch for interactive planning.
    pub enable_interactive_planning: bool,
    /// Phrases that always trigger planning.
    pub planning_keywords: Vec<String>,
    /// Regexes for simple exploration that never plans.
    pub exploration_patterns: Vec<String>,
    /// Phrases marking complex implementation work.
    pub complex_implementation_keywords: Vec<String>,
    /// Regexes for multi-step modification sequences.
    pub modification_sequences: Vec<String>,
    /// Multi-step indicators, effective only together with an action verb.
    pub multi_step_indicators: Vec<String>,
    pub action_verbs: Vec<String>,
    /// Deliverable nouns; two or more trigger planning.
    pub deliverable_keywords: Vec<String>,
}

fn string_vec(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            enable_interactive_planning: true,
            planning_keywords: string_vec(&[
                "plan this",
                "create a plan",
                "show me the plan",
                "draft a plan",
                "plan for me",
                "let's plan",
                "make a plan",
            ]),
            exploration_patterns: string_vec(&[
                r"read\s+.*file",
                r"show\s+.*file",
                r"list\s+.*",
                r"find\s+.*",
                r"search\s+.*",
                r"explain\s+.*",
                r"what\s+is.*",
                r"how\s+does.*work",
                r"check\s+.*status",
                r"view\s+.*log",
            ]),
            complex_implementation_keywords: string_vec(&[
                "implement and",
                "create and deploy",
                "build and test",
                "design and implement",
                "refactor entire",
                "migrate from",
                "upgrade from",
                "convert to",
                "generate comprehensive",
                "create full",
                "build complete",
            ]),
            modification_sequences: string_vec(&[
                r"(add|create|implement).*then.*(test|deploy|document)",
                r"(refactor|modify).*and.*(update|change|add)",
                r"(analyze|review).*then.*(implement|create|modify)",
                r"(setup|configure).*and.*(deploy|test|monitor)",
            ]),
            multi_step_indicators: string_vec(&[
                "start by",
                "then",
                "after that",
                "next",
                "finally",
                "first",
                "second",
                "third",
                "step 1",
                "step 2",
                "step 3",
                "and then",
                "followed by",
                "subsequently",
            ]),
            action_verbs: string_vec(&[
                "implement",
                "create",
                "build",
                "develop",
                "design",
                "refactor",
                "generate",
                "deploy",
                "configure",
                "setup",
                "migrate",
                "convert",
            ]),
            deliverable_keywords: string_vec(&[
                "report",
                "analysis",
                "implementation",
                "documentation",
                "enhancement",
                "system",
                "application",
                "service",
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLoopConfig {
    /// Retry budget per user message (attempts = max_retries + 1).
    pub max_retries: u32,
    /// Circuit breaker: events allowed per attempt.
    pub max_events_per_attempt: usize,
    /// Circuit breaker: wall-clock seconds allowed per attempt.
    pub attempt_timeout_secs: u64,
    /// Consecutive errors across attempts before giving up.
    pub max_consecutive_errors: u32,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_events_per_attempt: 50,
            attempt_timeout_secs: 300,
            max_consecutive_errors: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Recovery attempts per failed invocation.
    pub max_retries: u32,
    /// Default per-tool timeout, doubled by timeout-class recovery.
    pub default_timeout_secs: u64,
    /// Shell commands that run without approval.
    pub default_safe_commands: Vec<String>,
    /// Gate unvetted shell execution behind explicit approval.
    pub require_shell_approval: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_timeout_secs: 60,
            default_safe_commands: string_vec(&[
                "ls", "cat", "head", "tail", "pwd", "echo", "grep", "find", "wc", "git", "docker",
                "kubectl", "terraform", "helm", "cargo", "npm", "yarn", "python", "pip",
            ]),
            require_shell_approval: true,
        }
    }
}
