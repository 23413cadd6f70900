//! Reasoning Backend Abstraction Layer
//!
//! The agent loop never talks to a model directly. It hands a [`Prompt`] to a
//! [`ReasoningBackend`] and gets back exactly one [`Decision`]: invoke a tool,
//! or finalize with a verdict. Decision parsing is deterministic and tolerant
//! of the usual model output shapes (raw JSON, fenced JSON, JSON embedded in
//! prose).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod openai;

/// Errors a reasoning backend can report for one `decide` call
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Transport failure, timeout, rate limit or server error. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered, but not with a usable decision.
    #[error("malformed decision: {0}")]
    Malformed(String),
}

/// Message in a reasoning conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// A fully rendered reasoning request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub messages: Vec<Message>,
}

impl Prompt {
    /// Total characters across all messages
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

/// Verdict on a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supported,
    Refuted,
    Inconclusive,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Supported => "supported",
            Verdict::Refuted => "refuted",
            Verdict::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supported" => Some(Verdict::Supported),
            "refuted" => Some(Verdict::Refuted),
            "inconclusive" => Some(Verdict::Inconclusive),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to run one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

/// Request to end the session with a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finalization {
    pub verdict: Verdict,
    pub rationale: String,
    /// Finding ids backing the verdict, in the order the backend gave them
    #[serde(default)]
    pub cited_evidence: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

/// One reasoning step's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    InvokeTool(ToolInvocation),
    Finalize(Finalization),
}

impl Decision {
    pub fn thought(&self) -> Option<&str> {
        match self {
            Decision::InvokeTool(inv) => inv.thought.as_deref(),
            Decision::Finalize(fin) => fin.thought.as_deref(),
        }
    }
}

/// Reasoning backend trait that all adapters must implement
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Returns the name of the backend (used in logs)
    fn name(&self) -> &str;

    /// Produce exactly one decision for the given prompt
    async fn decide(&self, prompt: &Prompt) -> Result<Decision, BackendError>;

    /// Check if the backend is currently reachable.
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Parse a decision out of model output.
///
/// Handles multiple output formats:
/// 1. Raw JSON: `{"action": "...", ...}`
/// 2. Fenced JSON (with or without trailing text)
/// 3. JSON embedded in prose: scans for `{"action"` anywhere
pub fn parse_decision(content: &str) -> Result<Decision, BackendError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(BackendError::Malformed("empty response".to_string()));
    }

    // Keep the most specific error so re-prompts can say what was wrong
    let mut last_error = None;

    match try_parse_decision_json(trimmed) {
        Ok(decision) => return Ok(decision),
        Err(e) => last_error = e.or(last_error),
    }

    if let Some(inner) = extract_fenced_json(trimmed) {
        match try_parse_decision_json(inner.trim()) {
            Ok(decision) => return Ok(decision),
            Err(e) => last_error = e.or(last_error),
        }
    }

    let mut search_from = 0;
    while let Some(rel) = trimmed[search_from..].find("{\"action\"") {
        let pos = search_from + rel;
        if let Some(json_str) = extract_balanced_json(&trimmed[pos..]) {
            match try_parse_decision_json(json_str) {
                Ok(decision) => return Ok(decision),
                Err(e) => last_error = e.or(last_error),
            }
        }
        search_from = pos + 1;
    }

    Err(BackendError::Malformed(last_error.unwrap_or_else(|| {
        "no decision object found in response".to_string()
    })))
}

/// Try to parse a string as a decision object.
///
/// `Err(None)` means the text was not JSON at all, `Err(Some(reason))` means
/// it was JSON but not a valid decision.
fn try_parse_decision_json(s: &str) -> Result<Decision, Option<String>> {
    let json: Value = serde_json::from_str(s).map_err(|_| None)?;
    decision_from_value(json).map_err(Some)
}

/// Interpret a JSON value as a decision
pub fn decision_from_value(json: Value) -> Result<Decision, String> {
    let object = json
        .as_object()
        .ok_or_else(|| "decision must be a JSON object".to_string())?;
    let action = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing \"action\" field".to_string())?;

    match action {
        "invoke_tool" => {
            let tool = object
                .get("tool")
                .and_then(Value::as_str)
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| "invoke_tool requires a \"tool\" name".to_string())?;
            Ok(Decision::InvokeTool(ToolInvocation {
                tool: tool.trim().to_string(),
                arguments: object.get("arguments").cloned().unwrap_or(Value::Null),
                thought: string_field(object, "thought"),
            }))
        }
        "finalize" => {
            let verdict_raw = object
                .get("verdict")
                .and_then(Value::as_str)
                .ok_or_else(|| "finalize requires a \"verdict\"".to_string())?;
            let verdict = Verdict::parse(verdict_raw).ok_or_else(|| {
                format!(
                    "unknown verdict '{}' (expected supported, refuted or inconclusive)",
                    verdict_raw
                )
            })?;
            let rationale = string_field(object, "rationale").unwrap_or_default();
            let cited_evidence = match object.get("cited_evidence") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(ids)) => ids
                    .iter()
                    .map(|id| {
                        id.as_u64()
                            .ok_or_else(|| format!("citation {} is not a finding id", id))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return Err("\"cited_evidence\" must be an array of ids".to_string()),
            };
            Ok(Decision::Finalize(Finalization {
                verdict,
                rationale,
                cited_evidence,
                thought: string_field(object, "thought"),
            }))
        }
        other => Err(format!(
            "unknown action '{}' (expected invoke_tool or finalize)",
            other
        )),
    }
}

fn string_field(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        let system_msg = Message::system("You are a fact checker");
        assert_eq!(system_msg.role, MessageRole::System);
        assert_eq!(system_msg.role.to_string(), "system");
    }

    #[test]
    fn test_parse_raw_invoke_tool() {
        let decision = parse_decision(
            r#"{"action": "invoke_tool", "tool": "ocr", "arguments": {"image_url": "https://x/a.jpg"}, "thought": "read the sign"}"#,
        )
        .unwrap();

        assert_eq!(
            decision,
            Decision::InvokeTool(ToolInvocation {
                tool: "ocr".to_string(),
                arguments: json!({"image_url": "https://x/a.jpg"}),
                thought: Some("read the sign".to_string()),
            })
        );
        assert_eq!(decision.thought(), Some("read the sign"));
    }

    #[test]
    fn test_parse_fenced_finalize_with_trailing_text() {
        let content = "Here is my answer:\n```json\n{\"action\": \"finalize\", \"verdict\": \"Supported\", \"rationale\": \"landmark matches\", \"cited_evidence\": [1, 2]}\n```\nDone.";
        match parse_decision(content).unwrap() {
            Decision::Finalize(fin) => {
                assert_eq!(fin.verdict, Verdict::Supported);
                assert_eq!(fin.cited_evidence, vec![1, 2]);
                assert_eq!(fin.rationale, "landmark matches");
            }
            other => panic!("expected finalization, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_json_embedded_in_prose() {
        let content = r#"I think we should search. {"action": "invoke_tool", "tool": "web_search", "arguments": {"query": "tour {eiffel}"}} ok?"#;
        match parse_decision(content).unwrap() {
            Decision::InvokeTool(inv) => {
                assert_eq!(inv.tool, "web_search");
                assert_eq!(inv.arguments, json!({"query": "tour {eiffel}"}));
            }
            other => panic!("expected invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_prose_is_malformed() {
        let err = parse_decision("The photo is probably Paris.").unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn test_unknown_verdict_reports_reason() {
        let err = parse_decision(r#"{"action": "finalize", "verdict": "maybe", "rationale": "?"}"#)
            .unwrap_err();
        match err {
            BackendError::Malformed(reason) => assert!(reason.contains("unknown verdict 'maybe'")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_citation_is_malformed() {
        let err = parse_decision(
            r#"{"action": "finalize", "verdict": "refuted", "rationale": "x", "cited_evidence": ["one"]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn test_decision_serialization_is_tagged() {
        let decision = Decision::Finalize(Finalization {
            verdict: Verdict::Inconclusive,
            rationale: "not enough".to_string(),
            cited_evidence: vec![],
            thought: None,
        });
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["action"], "finalize");
        assert_eq!(json["verdict"], "inconclusive");
    }
}
