//! Judge Engine Library
//!
//! This library provides the core functionality of the judge engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Session archive persistence module
pub mod db;

/// Reasoning backend abstraction layer
pub mod llm;

/// Agent loop core module
pub mod agent;

/// Tool registry, dispatcher and built-in capability providers
pub mod tools;

/// Ordered per-session event streaming
pub mod stream;

/// HTTP surface over the session API
pub mod server;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
