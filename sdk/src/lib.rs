//! Judge SDK
//!
//! Shared library providing the error taxonomy, argument schemas and the
//! capability provider contract. This crate is used by the engine and by
//! anything that implements an analysis capability.

/// Capability provider trait
pub mod capability;

/// Error types and handling
pub mod errors;

/// Tool schema and provider input/output types
pub mod types;

// Re-export commonly used types
pub use capability::CapabilityProvider;
pub use errors::{ErrorClass, JudgeError, JudgeErrorExt};
pub use types::{
    ArgSchema, ArgumentProblem, FieldSpec, FieldType, ProviderError, ProviderOutput, ToolArgs,
};
