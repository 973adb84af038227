//! Interactive planning sub-protocol.
//!
//! Certain user requests are diverted into plan generation: the outgoing
//! LLM request is rewritten to ask for a step-by-step plan with tools
//! disabled, the generated plan is held for explicit approval, and on
//! approval the next request is rewritten into an execution instruction.
//! Decisions are result-typed; there is no exception control flow.

pub mod templates;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::PlanningConfig;
use crate::llm::{LlmRequest, LlmResponse, Message, MessageRole};

/// Nouns that mark a feedback message as an unrelated new request.
const UNRELATED_KEYWORDS: &[&str] = &[
    "k8s",
    "kubernetes",
    "cluster",
    "pod",
    "deployment",
    "service",
    "database",
    "db",
    "server",
    "api",
    "endpoint",
    "url",
    "user",
    "login",
    "password",
    "auth",
    "security",
    "weather",
    "time",
    "date",
    "location",
    "email",
    "what is",
    "how do i",
    "where is",
    "when",
    "who",
    "status",
    "health",
    "monitoring",
    "metrics",
];

/// Keywords that mark plan feedback.
const PLAN_FEEDBACK_KEYWORDS: &[&str] = &[
    "plan",
    "step",
    "phase",
    "approach",
    "methodology",
    "strategy",
    "add",
    "remove",
    "change",
    "modify",
    "revise",
    "update",
    "shorter",
    "longer",
    "simpler",
    "more detailed",
    "before",
    "after",
    "instead",
    "also include",
    "don't include",
    "different approach",
    "alternative",
    "better way",
];

/// Modification phrasings that suggest feedback when no unrelated noun
/// appears.
const MODIFICATION_PATTERNS: &[&str] = &[
    "make it",
    "can you",
    "could you",
    "please",
    "try to",
    "instead of",
    "rather than",
    "what if",
    "how about",
];

/// Terms that mark a request as code-related, warranting the code-context
/// section in the planning prompt.
const CODE_CONTEXT_TERMS: &[&str] = &[
    "codebase", "code", "file", "function", "class", "module", "analyze", "agent",
];

/// Exactly one of the three phases holds at any time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum PlanningPhase {
    #[default]
    Idle,
    /// The upcoming LLM call has been rewritten to ask for a plan.
    PlanGenerationPending,
    /// A plan is stored; the next user message is approval, feedback, or an
    /// unrelated new request.
    AwaitingApproval { plan: String },
}

/// Outcome of the before-model planning pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanningDecision {
    /// No planning action; normal processing continues.
    PassThrough,
    /// The manager fully handled the turn; return this response to the user
    /// without calling the LLM.
    Synthesize(LlmResponse),
    /// The user approved the stored plan; the run loop rewrites the next
    /// request into an execution instruction.
    PlanApproved(String),
}

/// Manages the interactive planning state machine.
pub struct PlanningManager {
    config: PlanningConfig,
    exploration_patterns: Vec<Regex>,
    modification_sequences: Vec<Regex>,
    phase: PlanningPhase,
}

impl PlanningManager {
    pub fn new(config: PlanningConfig) -> Self {
        let exploration_patterns = compile_patterns(&config.exploration_patterns);
        let modification_sequences = compile_patterns(&config.modification_sequences);
        Self {
            config,
            exploration_patterns,
            modification_sequences,
            phase: PlanningPhase::Idle,
        }
    }

    pub fn reset(&mut self) {
        self.phase = PlanningPhase::Idle;
        debug!("planning state reset");
    }

    pub fn is_plan_generation_turn(&self) -> bool {
        self.phase == PlanningPhase::PlanGenerationPending
    }

    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self.phase, PlanningPhase::AwaitingApproval { .. })
    }

    pub fn pending_plan(&self) -> Option<&str> {
        match &self.phase {
            PlanningPhase::AwaitingApproval { plan } => Some(plan),
            _ => None,
        }
    }

    /// Planning logic before the main LLM call. May rewrite `request` in
    /// place for plan generation.
    pub fn handle_before_model(
        &mut self,
        user_message: Option<&str>,
        request: &mut LlmRequest,
    ) -> PlanningDecision {
        if self.is_awaiting_approval() {
            let Some(message) = user_message else {
                return PlanningDecision::PassThrough;
            };
            let normalized = message.trim().to_lowercase();
            if normalized == "approve" {
                info!("user approved the plan");
                let approved = self.pending_plan().unwrap_or_default().to_string();
                self.reset();
                return PlanningDecision::PlanApproved(approved);
            }
            if is_plan_related_feedback(message) {
                info!("user provided feedback on the plan, resetting planning state");
                self.reset();
                return PlanningDecision::Synthesize(LlmResponse::from_text(
                    templates::FEEDBACK_ACK,
                ));
            }
            info!("message is a new request, not plan feedback; resetting planning state");
            self.reset();
            return PlanningDecision::PassThrough;
        }

        if self.config.enable_interactive_planning {
            if let Some(message) = user_message {
                if self.should_trigger_heuristic(message) {
                    info!("planning heuristic triggered, rewriting request for plan generation");
                    self.phase = PlanningPhase::PlanGenerationPending;

                    let lower = message.to_lowercase();
                    let code_context = if CODE_CONTEXT_TERMS
                        .iter()
                        .any(|term| lower.contains(term))
                    {
                        templates::CODE_CONTEXT_SECTION
                    } else {
                        ""
                    };
                    let prompt = templates::planning_prompt(message, code_context);

                    // A plan-generation turn gets exactly one user message
                    // and no tools.
                    request.contents = vec![Message::user(prompt)];
                    request.tools.clear();
                }
            }
        }

        PlanningDecision::PassThrough
    }

    /// Planning logic after the LLM call. Returns a synthesized response
    /// when the manager intercepts the turn.
    pub fn handle_after_model(&mut self, response: &LlmResponse) -> Option<LlmResponse> {
        if self.phase != PlanningPhase::PlanGenerationPending {
            return None;
        }

        match response.text() {
            Some(plan_text) => {
                info!(chars = plan_text.len(), "captured generated plan");
                let user_facing = format!("{plan_text}\n\n{}", templates::APPROVAL_PROMPT);
                self.phase = PlanningPhase::AwaitingApproval { plan: plan_text };
                let mut synthesized = LlmResponse::from_text(user_facing);
                synthesized.usage = response.usage;
                Some(synthesized)
            }
            None => {
                warn!("plan generation turn produced no extractable text");
                self.reset();
                Some(LlmResponse::from_text(templates::GENERATION_FAILED))
            }
        }
    }

    /// Trigger heuristic for a new user message. Rule order is significant:
    /// explicit keywords always trigger, simple exploration short-circuits
    /// before the complexity rules.
    pub fn should_trigger_heuristic(&self, user_message: &str) -> bool {
        let lower = user_message.to_lowercase();

        if self
            .config
            .planning_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
        {
            info!("explicit planning request detected");
            return true;
        }

        for pattern in &self.exploration_patterns {
            if pattern.is_match(&lower) {
                debug!(pattern = pattern.as_str(), "simple exploration, skipping planning");
                return false;
            }
        }

        if self
            .config
            .complex_implementation_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
        {
            info!("complex implementation task detected, triggering planning");
            return true;
        }

        for pattern in &self.modification_sequences {
            if pattern.is_match(&lower) {
                info!(pattern = pattern.as_str(), "multi-step sequence detected");
                return true;
            }
        }

        let has_multi_step = self
            .config
            .multi_step_indicators
            .iter()
            .any(|indicator| lower.contains(indicator.as_str()));
        let has_action_verb = self
            .config
            .action_verbs
            .iter()
            .any(|verb| lower.contains(verb.as_str()));
        if has_multi_step && has_action_verb {
            info!("multi-step implementation task detected");
            return true;
        }

        let deliverables = self
            .config
            .deliverable_keywords
            .iter()
            .filter(|keyword| lower.contains(keyword.as_str()))
            .count();
        if deliverables >= 2 {
            info!(deliverables, "multiple deliverables detected");
            return true;
        }

        false
    }
}

/// Rewrite an approved-plan request: all user-role messages collapse into a
/// single execution instruction, non-user messages are preserved.
pub fn rewrite_request_for_execution(request: &mut LlmRequest, approved_plan: &str) {
    let instruction = Message::user(templates::execution_instruction(approved_plan));
    let mut contents = Vec::with_capacity(request.contents.len());
    let mut replaced = false;
    for message in request.contents.drain(..) {
        if message.role == MessageRole::User {
            if !replaced {
                contents.push(instruction.clone());
                replaced = true;
            }
        } else {
            contents.push(message);
        }
    }
    if !replaced {
        contents.push(instruction);
    }
    request.contents = contents;
}

/// Classify an awaiting-approval message as plan feedback versus a new
/// request.
fn is_plan_related_feedback(user_message: &str) -> bool {
    let lower = user_message.trim().to_lowercase();

    if lower == "approve" {
        return true;
    }

    if PLAN_FEEDBACK_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
    {
        return true;
    }

    if MODIFICATION_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        // Modification language about an unrelated domain is a new request.
        return !UNRELATED_KEYWORDS
            .iter()
            .any(|keyword| lower.contains(keyword));
    }

    // Short interrogatives are new requests by rule.
    let word_count = user_message.split_whitespace().count();
    if word_count <= 8
        && ["what", "how", "where", "when", "who", "why"]
            .iter()
            .any(|word| lower.contains(word))
    {
        return false;
    }

    false
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(pattern, %error, "ignoring invalid heuristic pattern");
                None
            }
        })
        .collect()
}
