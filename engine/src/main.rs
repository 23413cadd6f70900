// Judge engine
// Main entry point for the judge binary

use clap::Parser;
use judge_engine::cli::{Cli, Command};
use judge_engine::config::Config;
use judge_engine::handlers::{
    handle_history, handle_replay, handle_run, handle_serve, handle_tools, OutputFormat,
};
use judge_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = match &cli.config {
        Some(config_path) => Config::load_from_path(config_path),
        None => Config::load_or_create(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Telemetry is not up yet; make the failure visible anyway
            init_telemetry();
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    // RUST_LOG still takes priority over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));
    tracing::info!("Judge Engine v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { bind } => {
            tracing::info!("Starting server...");
            handle_serve(bind, &config).await
        }

        Command::Run {
            claim,
            media,
            max_iterations,
            max_seconds,
        } => {
            tracing::info!("Verifying claim: {}", claim);
            handle_run(claim, media, max_iterations, max_seconds, &config, format).await
        }

        Command::Tools => handle_tools(&config, format).await,

        Command::History { limit } => {
            tracing::info!("Showing last {} sessions", limit);
            handle_history(limit, &config, format).await
        }

        Command::Replay { session_id } => {
            tracing::info!("Replaying session: {}", session_id);
            handle_replay(session_id, &config, format).await
        }
    }
}
