//! OpenAI-compatible reasoning backend
//!
//! Talks to any server exposing `/chat/completions` (vLLM, llama.cpp server,
//! hosted OpenAI). The model is asked to answer with a single decision object;
//! native `tool_calls` are accepted as well and mapped to a tool invocation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{
    parse_decision, BackendError, Decision, Message, Prompt, ReasoningBackend, ToolInvocation,
};
use crate::config::LLMConfig;
use judge_sdk::errors::JudgeError;

/// OpenAI-compatible backend configuration
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    /// Base URL, without the trailing `/chat/completions`
    base_url: String,

    model: String,

    /// Bearer token, read from the environment at construction
    api_key: Option<String>,

    temperature: f64,

    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<NativeToolCall>,
}

#[derive(Debug, Deserialize)]
struct NativeToolCall {
    function: NativeFunction,
}

#[derive(Debug, Deserialize)]
struct NativeFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl OpenAiCompatibleBackend {
    /// Create a new backend
    ///
    /// # Arguments
    /// * `base_url` - e.g. "http://127.0.0.1:8008/v1"
    /// * `model` - model name served at that endpoint
    /// * `timeout` - per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, JudgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JudgeError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            temperature: 0.1,
            client,
        })
    }

    /// Build a backend from the `[llm]` config section
    pub fn from_config(config: &LLMConfig) -> Result<Self, JudgeError> {
        let mut backend = Self::new(
            &config.base_url,
            &config.model,
            Duration::from_secs(config.timeout_secs),
        )?;
        backend.temperature = config.temperature;
        backend.api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty());
        Ok(backend)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Unavailable(format!("request to {} timed out", self.base_url))
        } else if e.is_connect() {
            BackendError::Unavailable(format!(
                "cannot connect to reasoning backend at {}",
                self.base_url
            ))
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

/// Turn a completion message into a decision
fn decision_from_message(message: ChatMessage) -> Result<Decision, BackendError> {
    if let Some(call) = message.tool_calls.into_iter().next() {
        let arguments = if call.function.arguments.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                BackendError::Malformed(format!(
                    "tool call arguments for '{}' are not JSON: {}",
                    call.function.name, e
                ))
            })?
        };
        return Ok(Decision::InvokeTool(ToolInvocation {
            tool: call.function.name,
            arguments,
            thought: message.content.filter(|c| !c.trim().is_empty()),
        }));
    }

    match message.content {
        Some(content) => parse_decision(&content),
        None => Err(BackendError::Malformed("empty content".to_string())),
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        matches!(request.send().await, Ok(r) if r.status().is_success())
    }

    async fn decide(&self, prompt: &Prompt) -> Result<Decision, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);

        let payload = ChatRequest {
            model: &self.model,
            messages: &prompt.messages,
            temperature: self.temperature,
            stream: false,
        };

        tracing::debug!(
            "Sending {} messages ({} chars) to {}",
            prompt.messages.len(),
            prompt.char_len(),
            url
        );

        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                BackendError::Unavailable(format!("HTTP {}: {}", status.as_u16(), text))
            } else {
                BackendError::Malformed(format!(
                    "backend rejected request with HTTP {}: {}",
                    status.as_u16(),
                    text
                ))
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(format!("invalid completion body: {}", e)))?;

        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Malformed("no choices in response".to_string()))?;

        decision_from_message(choice.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> ChatMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_native_tool_call_becomes_invocation() {
        let msg = message(json!({
            "content": "checking the sign",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "ocr", "arguments": "{\"image_url\": \"https://x/a.jpg\"}"}
            }]
        }));

        match decision_from_message(msg).unwrap() {
            Decision::InvokeTool(inv) => {
                assert_eq!(inv.tool, "ocr");
                assert_eq!(inv.arguments, json!({"image_url": "https://x/a.jpg"}));
                assert_eq!(inv.thought.as_deref(), Some("checking the sign"));
            }
            other => panic!("expected invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_native_arguments_are_malformed() {
        let msg = message(json!({
            "content": null,
            "tool_calls": [{"function": {"name": "ocr", "arguments": "{image_url"}}]
        }));
        assert!(matches!(
            decision_from_message(msg),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_content_is_malformed() {
        let msg = message(json!({"content": null}));
        assert!(matches!(
            decision_from_message(msg),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend =
            OpenAiCompatibleBackend::new("http://localhost:8008/v1/", "m", Duration::from_secs(5))
                .unwrap();
        assert_eq!(backend.base_url, "http://localhost:8008/v1");
    }
}
