//! Session state
//!
//! A session is one verification request. It is owned by the agent loop for
//! its whole life and turned into a [`SessionOutcome`] when it terminates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::evidence::{EvidenceMemory, Finding, FindingId};
use crate::llm::Verdict;
use crate::stream::StreamEvent;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Finalized,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Finalized => "finalized",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "finalized" => Ok(SessionStatus::Finalized),
            "failed" => Ok(SessionStatus::Failed),
            "aborted" => Ok(SessionStatus::Aborted),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Iteration and wall-clock limits of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum tool dispatches
    pub max_iterations: u32,
    #[serde(with = "duration_secs", rename = "max_seconds")]
    pub max_wall_clock: Duration,
}

impl Budget {
    pub fn new(max_iterations: u32, max_wall_clock: Duration) -> Self {
        Self {
            max_iterations,
            max_wall_clock,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Kind of an input media reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Other,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Other => "other",
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            "other" => Ok(MediaKind::Other),
            other => Err(format!("unknown media kind '{}'", other)),
        }
    }
}

/// Input media, referenced by URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub uri: String,
}

impl MediaRef {
    pub fn new(kind: MediaKind, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
        }
    }
}

impl FromStr for MediaRef {
    type Err = String;

    /// Parse `KIND:URI`, e.g. `image:https://cdn/x.jpg`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, uri) = s
            .split_once(':')
            .ok_or_else(|| format!("expected KIND:URI, got '{}'", s))?;
        if uri.is_empty() {
            return Err("media URI is empty".to_string());
        }
        Ok(MediaRef::new(kind.parse()?, uri))
    }
}

/// One verification request in progress
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub claim: String,
    pub media: Vec<MediaRef>,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub status: SessionStatus,
    /// Tool invocations requested so far
    pub iteration: u32,
    pub budget: Budget,
    pub evidence: EvidenceMemory,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        claim: impl Into<String>,
        media: Vec<MediaRef>,
        budget: Budget,
    ) -> Self {
        Self {
            id: id.into(),
            claim: claim.into(),
            media,
            started_at: Utc::now(),
            started: Instant::now(),
            status: SessionStatus::Running,
            iteration: 0,
            budget,
            evidence: EvidenceMemory::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_remaining(&self) -> Duration {
        self.budget.max_wall_clock.saturating_sub(self.elapsed())
    }

    pub fn out_of_time(&self) -> bool {
        self.elapsed() >= self.budget.max_wall_clock
    }

    pub fn iterations_remaining(&self) -> u32 {
        self.budget.max_iterations.saturating_sub(self.iteration)
    }
}

/// Failure summary kept with a terminal session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: String,
    pub message: String,
}

/// Everything a terminal session leaves behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub claim: String,
    pub media: Vec<MediaRef>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub citations: Vec<FindingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub evidence: Vec<Finding>,
    pub events: Vec<StreamEvent>,
}
