//! Command handlers for CLI operations
//!
//! - serve: run the HTTP server
//! - run: verify one claim in-process and print its event stream
//! - tools: list the tool catalog
//! - history: show archived sessions
//! - replay: print the archived events of a session

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{
    AgentCore, AgentSettings, Budget, CondensePolicy, MediaRef, PromptBuilder, PromptTemplates,
    SessionManager,
};
use crate::config::Config;
use crate::db::{Database, SessionArchive};
use crate::llm::openai::OpenAiCompatibleBackend;
use crate::llm::ReasoningBackend;
use crate::stream::StreamEvent;
use crate::tools::catalog::registry_from_config;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Wire up registry, backend, prompt builder and loop from configuration
pub fn build_manager(config: &Config, archive: Option<SessionArchive>) -> Result<SessionManager> {
    let tools = Arc::new(registry_from_config(config).context("Failed to build tool registry")?);
    let backend: Arc<dyn ReasoningBackend> = Arc::new(
        OpenAiCompatibleBackend::from_config(&config.llm)
            .context("Failed to create reasoning backend")?,
    );
    let prompts = PromptBuilder::new(
        Arc::new(PromptTemplates::from_config(&config.prompts)),
        CondensePolicy::from(&config.memory),
    );
    let core = AgentCore::new(backend, tools, prompts, AgentSettings::from_config(config));

    Ok(SessionManager::from_config(Arc::new(core), config, archive))
}

async fn open_database(config: &Config) -> Result<Database> {
    Database::new(&config.database_path())
        .await
        .context("Failed to open database")
}

/// Start the HTTP server
pub async fn handle_serve(bind: Option<String>, config: &Config) -> Result<()> {
    let database = open_database(config).await?;
    let manager = build_manager(config, Some(database.archive()))?;
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());

    crate::server::serve(manager, &addr).await?;
    database.close().await
}

/// Verify one claim and print every event as it arrives
pub async fn handle_run(
    claim: String,
    media: Vec<MediaRef>,
    max_iterations: Option<u32>,
    max_seconds: Option<u64>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = open_database(config).await?;
    let manager = build_manager(config, Some(database.archive()))?;

    let defaults = manager.default_budget();
    let budget = Budget::new(
        max_iterations.unwrap_or(defaults.max_iterations),
        max_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_wall_clock),
    );

    let session_id = manager.start_session(claim, media, Some(budget)).await?;
    let mut events = manager.stream_events(&session_id).await?;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(&event, format)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                manager.abort_session(&session_id).await?;
            }
        }
    }

    let status = manager.wait_for_completion(&session_id).await?;
    tracing::debug!("Session {} ended as {}", session_id, status);

    database.close().await
}

fn print_event(event: &StreamEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => print!("{}", event.to_sse()),
    }
    Ok(())
}

/// List the registered tools
pub async fn handle_tools(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = registry_from_config(config)?;
    let tools = registry.descriptors();

    match format {
        OutputFormat::Text => {
            println!("Registered tools ({}):", tools.len());
            println!();
            for tool in &tools {
                println!("{}", tool.name);
                println!("  {}", tool.description);
                for field in &tool.schema.fields {
                    println!(
                        "  - {} ({}{})",
                        field.name,
                        field.field_type,
                        if field.required { ", required" } else { "" }
                    );
                }
                println!();
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "tools": tools }))?);
        }
    }

    Ok(())
}

/// Show the last `limit` archived sessions
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let sessions = database
        .archive()
        .recent_sessions(limit as i64)
        .await
        .context("Failed to fetch session history")?;

    match format {
        OutputFormat::Text => {
            if sessions.is_empty() {
                println!("No sessions archived yet.");
            }
            for session in &sessions {
                println!("Session: {}", session.session_id);
                println!("  Claim: {}", session.claim);
                println!("  Status: {}", session.status);
                if let Some(verdict) = session.verdict {
                    println!("  Verdict: {}", verdict);
                }
                if let Some(failure) = &session.failure {
                    println!("  Failure: {} ({})", failure.message, failure.code);
                }
                println!("  Tool calls: {}", session.iterations);
                println!("  Started: {}", session.started_at.to_rfc3339());
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "sessions": sessions,
                "count": sessions.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await
}

/// Print an archived session and its event sequence
pub async fn handle_replay(session_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = open_database(config).await?;
    let outcome = database
        .archive()
        .load_outcome(&session_id)
        .await
        .context("Failed to fetch session")?
        .ok_or_else(|| anyhow::anyhow!("Session not found: {}", session_id))?;

    match format {
        OutputFormat::Text => {
            println!("Session Replay: {}", outcome.session_id);
            println!();
            println!("Claim: {}", outcome.claim);
            println!("Status: {}", outcome.status);
            println!();
            println!("Events ({} total):", outcome.events.len());
            println!();
            for event in &outcome.events {
                print!("{}", event.to_sse());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    database.close().await
}
