//! Evidence Memory
//!
//! Append-only store of the findings collected during one session. The full
//! chain is the provenance record that citations are checked against; the
//! condensed view is what goes into prompts. Condensation is a read-only
//! projection: it never changes the chain.
//!
//! # Condensation
//!
//! Each finding renders either in full (payload preview capped at
//! `entry_chars`) or compressed (outcome only). When the rendered chain is
//! over budget:
//!
//! 1. unprotected findings are compressed, failed before successful, oldest first
//! 2. unprotected findings are omitted in the same order
//! 3. protected findings outside the recent window are compressed, oldest first
//!
//! A finding is protected when it is among the `keep_recent` most recent,
//! has confidence at or above `high_confidence`, or is pinned. Protected
//! findings are never omitted and recent findings are never compressed, so
//! the result can exceed the budget when those alone do not fit.

use chrono::{DateTime, Utc};
use judge_sdk::errors::JudgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::config::MemoryConfig;

/// Identifier of a finding within its session, starting at 1
pub type FindingId = u64;

/// Length of error details in compressed lines
const COMPRESSED_DETAIL_CHARS: usize = 80;

/// Why a finding has `success = false`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider ran and found nothing usable
    Domain,
    /// Transport or engine error reported by the provider
    Provider,
    /// The call exceeded the tool timeout
    Timeout,
    /// The provider panicked
    Panic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Domain => "domain",
            FailureKind::Provider => "provider",
            FailureKind::Timeout => "timeout",
            FailureKind::Panic => "panic",
        }
    }

    /// Whether this failure came from the provider rather than the content
    pub fn is_provider_fault(&self) -> bool {
        !matches!(self, FailureKind::Domain)
    }
}

/// Result of one tool dispatch, before it is numbered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tool: String,
    /// Arguments echoed for provenance
    pub arguments: Value,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Observation {
    pub fn failure(
        tool: impl Into<String>,
        arguments: Value,
        kind: FailureKind,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            payload: Value::Null,
            confidence: None,
            success: false,
            error: Some(error.into()),
            failure_kind: Some(kind),
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    pub fn is_provider_fault(&self) -> bool {
        self.failure_kind.is_some_and(|k| k.is_provider_fault())
    }
}

/// A numbered, immutable entry of the evidence chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub iteration: u32,
    #[serde(flatten)]
    pub observation: Observation,
}

/// Knobs of the condensation policy
#[derive(Debug, Clone, PartialEq)]
pub struct CondensePolicy {
    pub budget_chars: usize,
    pub keep_recent: usize,
    pub high_confidence: f64,
    pub entry_chars: usize,
}

impl Default for CondensePolicy {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl From<&MemoryConfig> for CondensePolicy {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            budget_chars: config.budget_chars,
            keep_recent: config.keep_recent,
            high_confidence: config.high_confidence,
            entry_chars: config.entry_chars,
        }
    }
}

/// How one finding appears in the condensed view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryForm {
    Full,
    Compressed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CondensedEntry {
    pub id: FindingId,
    pub form: EntryForm,
    pub text: String,
}

/// Budget-constrained projection of the evidence chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CondensedEvidence {
    /// Kept findings in chain order
    pub entries: Vec<CondensedEntry>,
    /// Ids left out entirely, ascending
    pub omitted: Vec<FindingId>,
    pub total_findings: usize,
    pub within_budget: bool,
}

impl CondensedEvidence {
    /// Render as prompt text
    pub fn render(&self) -> String {
        if self.total_findings == 0 {
            return "No evidence collected yet.".to_string();
        }
        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        if let Some(header) = omitted_header(&self.omitted) {
            lines.push(header);
        }
        lines.extend(self.entries.iter().map(|e| e.text.clone()));
        lines.join("\n")
    }

    pub fn char_len(&self) -> usize {
        self.render().chars().count()
    }
}

/// Append-only evidence chain of one session
#[derive(Debug, Clone, Default)]
pub struct EvidenceMemory {
    findings: Vec<Finding>,
    pinned: BTreeSet<FindingId>,
    sealed: bool,
}

impl EvidenceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finding and return its id.
    ///
    /// Fails with `SessionFinalized` once the memory has been sealed.
    pub fn append(
        &mut self,
        iteration: u32,
        observation: Observation,
    ) -> Result<FindingId, JudgeError> {
        if self.sealed {
            return Err(JudgeError::SessionFinalized);
        }
        let id = self.findings.len() as FindingId + 1;
        self.findings.push(Finding {
            id,
            iteration,
            observation,
        });
        Ok(id)
    }

    /// Refuse further appends
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// The complete chain in append order
    pub fn full(&self) -> &[Finding] {
        &self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn get(&self, id: FindingId) -> Option<&Finding> {
        // Ids are dense and start at 1
        id.checked_sub(1)
            .and_then(|idx| self.findings.get(idx as usize))
    }

    pub fn contains(&self, id: FindingId) -> bool {
        self.get(id).is_some()
    }

    pub fn by_tool<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a Finding> + 'a {
        self.findings
            .iter()
            .filter(move |f| f.observation.tool == tool)
    }

    pub fn at_iteration(&self, iteration: u32) -> impl Iterator<Item = &Finding> + '_ {
        self.findings.iter().filter(move |f| f.iteration == iteration)
    }

    /// Cited ids that do not resolve, in citation order without repeats
    pub fn unresolved(&self, cited: &[FindingId]) -> Vec<FindingId> {
        let mut seen = BTreeSet::new();
        cited
            .iter()
            .copied()
            .filter(|id| !self.contains(*id) && seen.insert(*id))
            .collect()
    }

    /// Keep a finding out of the omission passes. Unknown ids are ignored.
    pub fn pin(&mut self, id: FindingId) {
        if self.contains(id) {
            self.pinned.insert(id);
        }
    }

    pub fn is_pinned(&self, id: FindingId) -> bool {
        self.pinned.contains(&id)
    }

    /// Condensed, order-preserving view of the chain under `policy`
    pub fn condensed(&self, policy: &CondensePolicy) -> CondensedEvidence {
        let n = self.findings.len();
        let recent_from = n.saturating_sub(policy.keep_recent);

        let full: Vec<String> = self
            .findings
            .iter()
            .map(|f| render_full(f, policy.entry_chars))
            .collect();
        let compressed: Vec<String> = self.findings.iter().map(render_compressed).collect();

        // None = omitted
        let mut forms: Vec<Option<EntryForm>> = vec![Some(EntryForm::Full); n];

        let is_recent = |idx: usize| idx >= recent_from;
        let is_protected = |idx: usize| {
            let f = &self.findings[idx];
            is_recent(idx)
                || self.pinned.contains(&f.id)
                || f.observation
                    .confidence
                    .is_some_and(|c| c >= policy.high_confidence)
        };

        let total = |forms: &[Option<EntryForm>]| -> usize {
            let mut omitted = Vec::new();
            let mut len = 0usize;
            let mut lines = 0usize;
            for (idx, form) in forms.iter().enumerate() {
                match form {
                    Some(EntryForm::Full) => {
                        len += full[idx].chars().count();
                        lines += 1;
                    }
                    Some(EntryForm::Compressed) => {
                        len += compressed[idx].chars().count();
                        lines += 1;
                    }
                    None => omitted.push(self.findings[idx].id),
                }
            }
            if let Some(header) = omitted_header(&omitted) {
                len += header.chars().count();
                lines += 1;
            }
            len + lines.saturating_sub(1)
        };

        // Failed before successful, then oldest first
        let mut unprotected: Vec<usize> = (0..n).filter(|&idx| !is_protected(idx)).collect();
        unprotected.sort_by_key(|&idx| (self.findings[idx].observation.success, idx));

        for &idx in &unprotected {
            if total(&forms) <= policy.budget_chars {
                break;
            }
            forms[idx] = Some(EntryForm::Compressed);
        }
        for &idx in &unprotected {
            if total(&forms) <= policy.budget_chars {
                break;
            }
            forms[idx] = None;
        }
        for idx in (0..n).filter(|&idx| is_protected(idx) && !is_recent(idx)) {
            if total(&forms) <= policy.budget_chars {
                break;
            }
            forms[idx] = Some(EntryForm::Compressed);
        }

        let within_budget = total(&forms) <= policy.budget_chars;
        let mut entries = Vec::new();
        let mut omitted = Vec::new();
        for (idx, form) in forms.into_iter().enumerate() {
            let id = self.findings[idx].id;
            match form {
                Some(EntryForm::Full) => entries.push(CondensedEntry {
                    id,
                    form: EntryForm::Full,
                    text: full[idx].clone(),
                }),
                Some(EntryForm::Compressed) => entries.push(CondensedEntry {
                    id,
                    form: EntryForm::Compressed,
                    text: compressed[idx].clone(),
                }),
                None => omitted.push(id),
            }
        }

        CondensedEvidence {
            entries,
            omitted,
            total_findings: n,
            within_budget,
        }
    }
}

fn omitted_header(omitted: &[FindingId]) -> Option<String> {
    if omitted.is_empty() {
        return None;
    }
    let ids: Vec<String> = omitted.iter().map(|id| format!("#{}", id)).collect();
    Some(format!(
        "({} older findings omitted: {})",
        omitted.len(),
        ids.join(", ")
    ))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

fn outcome(f: &Finding) -> String {
    let obs = &f.observation;
    let mut out = if obs.success {
        "OK".to_string()
    } else {
        match obs.failure_kind {
            Some(kind) if kind.is_provider_fault() => format!("FAILED ({})", kind.as_str()),
            _ => "NOT FOUND".to_string(),
        }
    };
    if let Some(conf) = obs.confidence {
        out.push_str(&format!(" confidence={:.2}", conf));
    }
    out
}

fn render_full(f: &Finding, entry_chars: usize) -> String {
    let obs = &f.observation;
    let detail = if obs.success {
        truncate_chars(&obs.payload.to_string(), entry_chars)
    } else {
        truncate_chars(obs.error.as_deref().unwrap_or("no detail"), entry_chars)
    };
    format!(
        "[#{} iter {}] {}({}) -> {}: {}",
        f.id,
        f.iteration,
        obs.tool,
        obs.arguments,
        outcome(f),
        detail
    )
}

fn render_compressed(f: &Finding) -> String {
    let obs = &f.observation;
    match (&obs.error, obs.success) {
        (Some(error), false) => format!(
            "[#{} iter {}] {} -> {}: {}",
            f.id,
            f.iteration,
            obs.tool,
            outcome(f),
            truncate_chars(error, COMPRESSED_DETAIL_CHARS)
        ),
        _ => format!(
            "[#{} iter {}] {} -> {} (details condensed)",
            f.id,
            f.iteration,
            obs.tool,
            outcome(f)
        ),
    }
}
