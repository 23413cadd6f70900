//! Prompt Builder
//!
//! Renders the next reasoning request from a session snapshot: the claim,
//! the media, the tool catalog, the condensed evidence and the decision
//! format. `build` is a pure function of its inputs, so the same snapshot
//! always yields the same prompt.

use std::fmt::Write as _;
use std::sync::Arc;

use super::evidence::CondensePolicy;
use super::session::Session;
use crate::config::PromptsConfig;
use crate::llm::{Message, Prompt};
use crate::tools::{ToolDescriptor, ToolRegistry};

const DEFAULT_SYSTEM: &str = "You are a multimodal fact-checking judge. You verify claims about \
images, audio and video by calling analysis tools and weighing what they return. \
Never guess tool output: call the tool and wait for the real result. \
Tool results with success=false are evidence too; adapt by trying other arguments, \
another tool, or by finalizing with lower certainty.";

const DEFAULT_INSTRUCTION: &str = r#"Answer with exactly ONE JSON object and nothing else.

To call a tool:
{"action": "invoke_tool", "tool": "<tool name>", "arguments": {...}, "thought": "<why>"}

To give the verdict:
{"action": "finalize", "verdict": "supported" | "refuted" | "inconclusive", "rationale": "<explanation>", "cited_evidence": [<finding ids>], "thought": "<why>"}

Only cite finding ids that appear in the evidence list (e.g. #2 is cited as 2)."#;

/// Process-wide prompt templates, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    pub system: String,
    pub instruction: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn from_config(config: &PromptsConfig) -> Self {
        let defaults = Self::default();
        Self {
            system: config.system.clone().unwrap_or(defaults.system),
            instruction: config.instruction.clone().unwrap_or(defaults.instruction),
        }
    }
}

/// Builds reasoning requests for the agent loop
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: Arc<PromptTemplates>,
    policy: CondensePolicy,
}

impl PromptBuilder {
    pub fn new(templates: Arc<PromptTemplates>, policy: CondensePolicy) -> Self {
        Self { templates, policy }
    }

    /// Render the prompt for the next decision.
    ///
    /// `conversation` holds earlier decisions and loop feedback; only the
    /// last `history_limit` entries are replayed.
    pub fn build(
        &self,
        session: &Session,
        tools: &ToolRegistry,
        conversation: &[Message],
        history_limit: usize,
    ) -> Prompt {
        let mut messages = Vec::with_capacity(2 + history_limit.min(conversation.len()));
        messages.push(Message::system(self.system_text(&tools.descriptors())));
        messages.push(Message::user(self.task_text(session)));

        let skip = conversation.len().saturating_sub(history_limit);
        messages.extend(conversation.iter().skip(skip).cloned());

        Prompt { messages }
    }

    fn system_text(&self, tools: &[ToolDescriptor]) -> String {
        let mut out = String::new();
        out.push_str(&self.templates.system);
        out.push_str("\n\n## Available tools\n");
        if tools.is_empty() {
            out.push_str("\nNo tools are available. Finalize with the information you have.\n");
        }
        for tool in tools {
            let _ = write!(out, "\n### {}\n{}\n", tool.name, tool.description);
            if tool.schema.fields.is_empty() {
                out.push_str("Arguments: none\n");
            }
            for field in &tool.schema.fields {
                let _ = write!(
                    out,
                    "- {} ({}, {})",
                    field.name,
                    field.field_type,
                    if field.required { "required" } else { "optional" }
                );
                if !field.description.is_empty() {
                    let _ = write!(out, ": {}", field.description);
                }
                out.push('\n');
            }
            for group in &tool.schema.any_of {
                let _ = writeln!(out, "At least one of [{}] must be given.", group.join(", "));
            }
        }
        out.push_str("\n## Decision format\n");
        out.push_str(&self.templates.instruction);
        out
    }

    fn task_text(&self, session: &Session) -> String {
        let mut out = String::new();
        let _ = write!(out, "## Claim\n{}\n", session.claim);

        out.push_str("\n## Media\n");
        if session.media.is_empty() {
            out.push_str("(none)\n");
        }
        for media in &session.media {
            let _ = writeln!(out, "- {}: {}", media.kind.as_str(), media.uri);
        }

        let condensed = session.evidence.condensed(&self.policy);
        let _ = write!(out, "\n## Evidence so far\n{}\n", condensed.render());

        let _ = write!(
            out,
            "\n## Budget\nTool calls used: {} of {}. Time budget: {}s.\n",
            session.iteration,
            session.budget.max_iterations,
            session.budget.max_wall_clock.as_secs()
        );
        if session.iterations_remaining() == 0 {
            out.push_str("No tool calls remain: you must finalize now.\n");
        }

        out.push_str("\nRespond with exactly one decision object.");
        out
    }
}
