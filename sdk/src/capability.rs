//! Capability provider trait
//!
//! A capability provider is any analysis engine (face recognition, OCR,
//! object detection, speech transcription) or search service the agent can
//! call. The engine only ever sees this uniform contract; argument
//! validation happens in the tool registry before `invoke` is reached.

use async_trait::async_trait;

use crate::types::{ProviderError, ProviderOutput, ToolArgs};

/// Trait that all capability providers must implement
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Returns the name of the provider (used in logs)
    fn name(&self) -> &str;

    /// Run the capability on already-validated arguments.
    ///
    /// Implementations should not panic; the dispatcher isolates panics, but
    /// reports them as provider errors.
    async fn invoke(&self, args: &ToolArgs) -> Result<ProviderOutput, ProviderError>;
}
