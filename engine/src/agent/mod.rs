//! Agent Loop Core
//!
//! A session is driven through a reason-act-record cycle until the
//! reasoning backend finalizes a verdict or a budget or error policy ends
//! it. Every step is recorded in the session's evidence chain and streamed
//! to the client.

pub mod core;
pub mod evidence;
pub mod manager;
pub mod prompt;
pub mod session;

pub use core::{AgentCore, AgentSettings};
pub use evidence::{CondensePolicy, EvidenceMemory, Finding, FindingId, Observation};
pub use manager::SessionManager;
pub use prompt::{PromptBuilder, PromptTemplates};
pub use session::{Budget, MediaKind, MediaRef, Session, SessionOutcome, SessionStatus};
