//! Prompt templates for the interactive planning protocol.

/// Literal approval prompt appended to every generated plan.
pub const APPROVAL_PROMPT: &str =
    "Does this plan look correct? Please type 'approve' to proceed, or provide feedback to revise the plan.";

/// Acknowledgment returned when the user gives feedback instead of approval.
pub const FEEDBACK_ACK: &str = "Okay, I've received your feedback. I will consider it for the next step. If you'd like me to try planning again with this new information, please let me know or re-state your goal.";

/// Apology returned when plan generation produced no extractable text.
pub const GENERATION_FAILED: &str =
    "I tried to generate a plan, but something went wrong. Please try rephrasing your request.";

/// Code-context block attached when the request mentions a codebase.
pub const CODE_CONTEXT_SECTION: &str = "\n--- RELEVANT CODE CONTEXT ---\n\
Note: Planning system detected this is a code-related request.\n\
The agent has access to tools like 'code_search', 'read_file', and 'index_directory'\n\
to analyze and understand the codebase structure during plan execution.\n\
--- END RELEVANT CODE CONTEXT ---\n";

/// Render the plan-generation prompt for a user request.
pub fn planning_prompt(user_request: &str, code_context_section: &str) -> String {
    format!(
        "You are an expert software development assistant with access to powerful code analysis and modification tools. The user has made the following request:\n\
\n\
--- USER REQUEST ---\n\
{user_request}\n\
--- END USER REQUEST ---\n\
\n\
{code_context_section}\n\
Your task is to generate a comprehensive, step-by-step plan that leverages your available tools effectively. Consider that you have access to:\n\
- File system tools: read_file, write_file, list_dir\n\
- Code analysis tools: code_search, index_directory, retrieve_code_context\n\
- Shell command tools: execute_shell\n\
\n\
**Plan Structure Requirements:**\n\
1. **Discovery & Analysis Phase**: How you'll understand the current state/codebase\n\
2. **Detailed Action Steps**: Specific files to read/modify, tools to use, commands to run\n\
3. **Implementation Phase**: Concrete changes you'll make\n\
4. **Validation & Documentation**: How you'll verify success and document results\n\
\n\
**For each step, specify:**\n\
- **Tool(s) to use**: Which specific tools you'll invoke\n\
- **Inputs/parameters**: What you'll search for, file paths, command arguments\n\
- **Expected outputs**: What information you expect to gather or what changes you'll make\n\
- **Dependencies**: Which steps must complete before this one can start\n\
\n\
Start your response with \"Here's my comprehensive plan to address your request:\" and then provide a detailed, well-structured plan."
    )
}

/// Render the execution instruction that replaces the user's "approve".
pub fn execution_instruction(approved_plan: &str) -> String {
    format!(
        "Please execute the following approved plan step by step. Start with Phase 1 and work through each step systematically, using the specified tools and following the dependencies outlined in the plan.\n\
\n\
APPROVED PLAN:\n\
{approved_plan}\n\
\n\
Begin execution now, starting with the first step."
    )
}

/// System message recorded when a plan is approved.
pub fn approved_plan_system_message(approved_plan: &str) -> String {
    format!(
        "SYSTEM: The user has approved the following plan. Proceed with implementation:\n{approved_plan}"
    )
}
