//! Error types and handling
//!
//! This module provides the error types used throughout the judge engine.
//! All errors implement the `JudgeErrorExt` trait which provides user-friendly
//! hints, a stable wire code, and the error class that decides how the agent
//! loop reacts to the error.
//!
//! # Error Classes
//!
//! - **Validation**: the reasoning backend (or a caller) made a mistake. The
//!   loop reports it and re-prompts; repeated occurrences fail the session.
//! - **Transient**: infrastructure hiccups, retried with bounded backoff by the
//!   layer that owns the call.
//! - **Fatal**: the session cannot continue and terminates as failed.
//! - **Infrastructure**: problems outside any single session (config, storage,
//!   lookups by session id).

use thiserror::Error;

/// Trait for judge error extensions
pub trait JudgeErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or reasoned around inside a session.
    fn is_recoverable(&self) -> bool;

    /// Stable snake_case identifier used in stream payloads and the archive
    fn code(&self) -> &'static str;

    /// Taxonomy class of the error
    fn class(&self) -> ErrorClass;
}

/// How the agent loop treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Transient,
    Fatal,
    Infrastructure,
}

/// Main judge error type
///
/// Messages never carry secrets (API keys are only ever read from the
/// environment and are not echoed back).
///
/// # Examples
///
/// ```
/// use judge_sdk::errors::{ErrorClass, JudgeError, JudgeErrorExt};
///
/// let error = JudgeError::UnknownTool("ocr_v2".to_string());
/// assert_eq!(error.code(), "unknown_tool");
/// assert_eq!(error.class(), ErrorClass::Validation);
/// assert!(error.is_recoverable());
///
/// let fatal = JudgeError::BudgetExceeded("max iterations (3)".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum JudgeError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Registry errors
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {}", .problems.join("; "))]
    InvalidArguments { tool: String, problems: Vec<String> },

    #[error("Tool busy: {0}")]
    ToolBusy(String),

    #[error("Tool {tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    // Reasoning backend errors
    #[error("Reasoning backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Malformed decision: {0}")]
    MalformedDecision(String),

    #[error("Invalid citation: finding ids {0:?} are not in the evidence chain")]
    InvalidCitation(Vec<u64>),

    // Session errors
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Session already finalized")]
    SessionFinalized,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Event stream already taken for session {0}")]
    StreamAlreadyTaken(String),

    #[error("Session aborted: {0}")]
    Aborted(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JudgeErrorExt for JudgeError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Archive operation failed. Check the data directory",

            Self::DuplicateTool(_) => "Each tool name may only be registered once",
            Self::UnknownTool(_) => "The requested tool is not available",
            Self::InvalidArguments { .. } => "Tool arguments do not match the tool schema",
            Self::ToolBusy(_) => "The analysis engine is saturated. Try again shortly",
            Self::ToolFailed { .. } => "An analysis engine failed in a way that stops the session",

            Self::BackendUnavailable(_) => "Reasoning backend unavailable. Check the LLM endpoint",
            Self::MalformedDecision(_) => "The reasoning backend produced an unusable answer",
            Self::InvalidCitation(_) => "The verdict cited evidence that does not exist",

            Self::BudgetExceeded(_) => "Verification too complex for the configured budget",
            Self::SessionFinalized => "The session has already reached a terminal state",
            Self::SessionNotFound(_) => "No session with that id",
            Self::StreamAlreadyTaken(_) => "Only one client may stream a session",
            Self::Aborted(_) => "The session was cancelled",

            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Validation | ErrorClass::Transient)
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::DuplicateTool(_) => "duplicate_tool",
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::ToolBusy(_) => "tool_busy",
            Self::ToolFailed { .. } => "tool_failed",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::MalformedDecision(_) => "malformed_decision",
            Self::InvalidCitation(_) => "invalid_citation",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::SessionFinalized => "session_finalized",
            Self::SessionNotFound(_) => "session_not_found",
            Self::StreamAlreadyTaken(_) => "stream_already_taken",
            Self::Aborted(_) => "aborted",
            Self::Network(_) => "network",
            Self::Io(_) => "io",
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownTool(_)
            | Self::InvalidArguments { .. }
            | Self::InvalidCitation(_)
            | Self::MalformedDecision(_) => ErrorClass::Validation,

            Self::ToolBusy(_) | Self::BackendUnavailable(_) | Self::Network(_) => {
                ErrorClass::Transient
            }

            Self::ToolFailed { .. }
            | Self::BudgetExceeded(_)
            | Self::SessionFinalized
            | Self::Aborted(_) => ErrorClass::Fatal,

            Self::Config(_)
            | Self::Database(_)
            | Self::DuplicateTool(_)
            | Self::SessionNotFound(_)
            | Self::StreamAlreadyTaken(_)
            | Self::Io(_) => ErrorClass::Infrastructure,
        }
    }
}
