//! Configuration management
//!
//! This module handles loading, validation, and management of the judge
//! configuration. Configuration is stored in TOML format at ~/.judge/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **server**: HTTP bind address
//! - **llm**: OpenAI-compatible reasoning backend
//! - **agent**: Iteration/time budgets and retry limits of the agent loop
//! - **memory**: Evidence condensation budget
//! - **stream**: Client stream buffering
//! - **search**: Web search provider
//! - **prompts**: Optional prompt template overrides
//! - **tools**: Capability provider endpoints and per-tool limits
//!
//! # Examples
//!
//! ```no_run
//! use judge_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Reasoning model: {}", config.llm.model);
//! println!("Max iterations: {}", config.agent.max_iterations);
//! # Ok(())
//! # }
//! ```

use judge_sdk::errors::JudgeError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Reasoning backend configuration
    pub llm: LLMConfig,

    /// Agent loop limits
    #[serde(default)]
    pub agent: AgentConfig,

    /// Evidence condensation
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Client stream buffering
    #[serde(default)]
    pub stream: StreamConfig,

    /// Web search provider
    #[serde(default)]
    pub search: SearchConfig,

    /// Prompt template overrides
    #[serde(default)]
    pub prompts: PromptsConfig,

    /// Capability providers
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Reasoning backend configuration (any OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL, e.g. http://127.0.0.1:8008/v1
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key (not stored in config)
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Agent loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default maximum tool dispatches per session
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Default wall-clock budget per session in seconds
    #[serde(default = "default_max_wall_clock")]
    pub max_wall_clock_secs: u64,

    /// Attempts per reasoning step when the backend is unavailable
    #[serde(default = "default_backend_attempts")]
    pub backend_attempts: u32,

    /// Base backoff between backend attempts in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Re-prompts allowed after unparseable decisions
    #[serde(default = "default_malformed_retries")]
    pub malformed_retries: u32,

    /// Consecutive re-prompts allowed after unknown tools / invalid arguments
    #[serde(default = "default_validation_retries")]
    pub validation_retries: u32,

    /// Re-prompts allowed after a finalization with dangling citations
    #[serde(default = "default_citation_retries")]
    pub citation_retries: u32,

    /// Conversation entries replayed into each prompt
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Grace period for in-flight calls after cancellation, in milliseconds
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

/// Evidence condensation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Character budget for the condensed evidence section of a prompt
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,

    /// Most recent findings always kept in full
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    /// Findings at or above this confidence are never omitted
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,

    /// Maximum payload characters rendered per finding
    #[serde(default = "default_entry_chars")]
    pub entry_chars: usize,
}

/// Client stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bounded channel capacity between the loop and the client
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Events held back while the client is slow
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,

    /// Time allowed to flush the backlog after the terminal event, in milliseconds
    #[serde(default = "default_finish_grace_ms")]
    pub finish_grace_ms: u64,
}

/// Web search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search API endpoint
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the search API key
    #[serde(default = "default_search_api_key_env")]
    pub api_key_env: String,

    /// Results returned per query
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

/// Prompt template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Replaces the built-in system preamble
    #[serde(default)]
    pub system: Option<String>,

    /// Replaces the built-in decision instruction
    #[serde(default)]
    pub instruction: Option<String>,
}

/// Kind of capability provider backing a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// JSON-over-HTTP inference engine
    Http,
    /// Web search
    Search,
}

/// What happens when a tool's permits are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    Queue,
    Reject,
}

/// Whether provider errors of a tool end the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Recoverable,
    Fatal,
}

/// A capability provider entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool name; built-in names pick up their catalog schema
    pub name: String,

    /// Provider kind
    pub kind: ToolKind,

    /// Endpoint for HTTP engines (search tools use `[search]`)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,

    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.judge/data")
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:8008/v1".to_string()
}

fn default_llm_model() -> String {
    "Qwen3-VL-30B-A3B-Instruct".to_string()
}

fn default_llm_api_key_env() -> String {
    "JUDGE_LLM_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.1
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_wall_clock() -> u64 {
    600
}

fn default_backend_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_malformed_retries() -> u32 {
    2
}

fn default_validation_retries() -> u32 {
    1
}

fn default_citation_retries() -> u32 {
    1
}

fn default_history_limit() -> usize {
    8
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

fn default_budget_chars() -> usize {
    6000
}

fn default_keep_recent() -> usize {
    3
}

fn default_high_confidence() -> f64 {
    0.85
}

fn default_entry_chars() -> usize {
    600
}

fn default_channel_capacity() -> usize {
    64
}

fn default_backlog_limit() -> usize {
    256
}

fn default_finish_grace_ms() -> u64 {
    2000
}

fn default_search_endpoint() -> String {
    "https://serpapi.com/search.json".to_string()
}

fn default_search_api_key_env() -> String {
    "SERPAPI_KEY".to_string()
}

fn default_max_results() -> usize {
    5
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Queue
}

fn default_busy_retries() -> u32 {
    2
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Recoverable
}

fn http_tool(name: &str, endpoint: &str) -> ToolConfig {
    ToolConfig {
        name: name.to_string(),
        kind: ToolKind::Http,
        endpoint: Some(endpoint.to_string()),
        enabled: true,
        timeout_secs: default_tool_timeout(),
        max_concurrency: default_max_concurrency(),
        busy_policy: default_busy_policy(),
        busy_retries: default_busy_retries(),
        failure_policy: default_failure_policy(),
    }
}

fn default_tools() -> Vec<ToolConfig> {
    vec![
        http_tool("face_recognition", "http://127.0.0.1:6980/api/v1/face"),
        http_tool("ocr", "http://127.0.0.1:6981/api/v1/ocr"),
        http_tool("object_detection", "http://127.0.0.1:6982/api/v1/detect"),
        http_tool("speech_transcription", "http://127.0.0.1:6983/api/v1/transcribe"),
        ToolConfig {
            name: "web_search".to_string(),
            kind: ToolKind::Search,
            endpoint: None,
            enabled: true,
            timeout_secs: default_tool_timeout(),
            max_concurrency: default_max_concurrency(),
            busy_policy: default_busy_policy(),
            busy_retries: default_busy_retries(),
            failure_policy: default_failure_policy(),
        },
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_wall_clock_secs: default_max_wall_clock(),
            backend_attempts: default_backend_attempts(),
            backoff_ms: default_backoff_ms(),
            malformed_retries: default_malformed_retries(),
            validation_retries: default_validation_retries(),
            citation_retries: default_citation_retries(),
            history_limit: default_history_limit(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
            keep_recent: default_keep_recent(),
            high_confidence: default_high_confidence(),
            entry_chars: default_entry_chars(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            backlog_limit: default_backlog_limit(),
            finish_grace_ms: default_finish_grace_ms(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_api_key_env(),
            max_results: default_max_results(),
        }
    }
}

impl AgentConfig {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_secs(self.max_wall_clock_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Config {
    /// Load configuration from the default location (~/.judge/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, JudgeError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, JudgeError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| JudgeError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, JudgeError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| JudgeError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, JudgeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                JudgeError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| JudgeError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| JudgeError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.judge/config.toml)
    fn default_config_path() -> Result<PathBuf, JudgeError> {
        let home = dirs::home_dir()
            .ok_or_else(|| JudgeError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".judge").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            server: ServerConfig::default(),
            llm: LLMConfig::default(),
            agent: AgentConfig::default(),
            memory: MemoryConfig::default(),
            stream: StreamConfig::default(),
            search: SearchConfig::default(),
            prompts: PromptsConfig::default(),
            tools: default_tools(),
        }
    }

    /// Path of the audit archive database
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("judge.db")
    }

    /// Validate and process configuration
    ///
    /// This method validates ranges and names, expands ~ in the data
    /// directory, and creates it if missing.
    fn validate_and_process(&mut self) -> Result<(), JudgeError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(JudgeError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.llm.temperature < 0.0 || self.llm.temperature > 2.0 {
            return Err(JudgeError::Config(
                "llm.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(JudgeError::Config(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.agent.backend_attempts == 0 {
            return Err(JudgeError::Config(
                "agent.backend_attempts must be at least 1".to_string(),
            ));
        }

        if self.memory.high_confidence < 0.0 || self.memory.high_confidence > 1.0 {
            return Err(JudgeError::Config(
                "memory.high_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.stream.channel_capacity == 0 {
            return Err(JudgeError::Config(
                "stream.channel_capacity must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(JudgeError::Config(format!(
                    "Tool '{}' is configured more than once",
                    tool.name
                )));
            }
            if tool.max_concurrency == 0 {
                return Err(JudgeError::Config(format!(
                    "Tool '{}': max_concurrency must be at least 1",
                    tool.name
                )));
            }
            if tool.kind == ToolKind::Http && tool.enabled && tool.endpoint.is_none() {
                return Err(JudgeError::Config(format!(
                    "Tool '{}': http tools need an endpoint",
                    tool.name
                )));
            }
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                JudgeError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, JudgeError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| JudgeError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| JudgeError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| JudgeError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.llm.temperature, 0.1);
        assert_eq!(config.tools.len(), 5);
        assert!(config
            .tools
            .iter()
            .all(|t| t.failure_policy == FailurePolicy::Recoverable));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.llm.model, deserialized.llm.model);
        assert_eq!(config.tools.len(), deserialized.tools.len());
    }

    #[test]
    fn test_duplicate_tool_names_rejected() {
        let mut config = Config::default_config();
        config.core.data_dir = std::env::temp_dir().join("judge-config-dup-test");
        config.tools.push(http_tool("ocr", "http://localhost:1"));

        let err = config.validate_and_process().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_http_tool_without_endpoint_rejected() {
        let mut config = Config::default_config();
        config.core.data_dir = std::env::temp_dir().join("judge-config-endpoint-test");
        config.tools[0].endpoint = None;

        assert!(config.validate_and_process().is_err());
    }
}
