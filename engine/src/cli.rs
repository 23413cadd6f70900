//! CLI interface for the judge
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::agent::MediaRef;

/// Multimodal fact-checking judge
///
/// Verifies claims about images, audio and video by letting a reasoning
/// model call analysis tools and collect evidence before giving a verdict.
#[derive(Parser, Debug)]
#[command(name = "judge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server
    Serve {
        /// Override the configured bind address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Verify one claim and print its event stream
    Run {
        /// The claim to verify
        #[arg(long)]
        claim: String,

        /// Media as KIND:URI, e.g. image:https://cdn/x.jpg (repeatable)
        #[arg(long = "media", value_name = "KIND:URI")]
        media: Vec<MediaRef>,

        /// Maximum tool calls
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Wall-clock budget in seconds
        #[arg(long)]
        max_seconds: Option<u64>,
    },

    /// List the registered tools and their argument schemas
    Tools,

    /// Show archived sessions
    History {
        /// Number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the archived event sequence of a session
    Replay {
        /// Session ID to replay
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MediaKind;

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["judge", "--json", "--log", "debug", "tools"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        assert!(matches!(cli.command, Command::Tools));
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from([
            "judge",
            "run",
            "--claim",
            "this photo was taken in Paris",
            "--media",
            "image:https://cdn/p.jpg",
            "--media",
            "audio:https://cdn/a.mp3",
            "--max-iterations",
            "4",
        ]);
        if let Command::Run {
            claim,
            media,
            max_iterations,
            max_seconds,
        } = cli.command
        {
            assert_eq!(claim, "this photo was taken in Paris");
            assert_eq!(media.len(), 2);
            assert_eq!(media[0].kind, MediaKind::Image);
            assert_eq!(media[1].uri, "https://cdn/a.mp3");
            assert_eq!(max_iterations, Some(4));
            assert_eq!(max_seconds, None);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_bad_media_is_rejected() {
        let parsed = Cli::try_parse_from(["judge", "run", "--claim", "x", "--media", "nokind"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_history_and_replay() {
        let cli = Cli::parse_from(["judge", "history", "--limit", "20"]);
        assert!(matches!(cli.command, Command::History { limit: 20 }));

        let cli = Cli::parse_from(["judge", "replay", "abc"]);
        if let Command::Replay { session_id } = cli.command {
            assert_eq!(session_id, "abc");
        } else {
            panic!("Expected Replay command");
        }
    }
}
