//! JSON-over-HTTP inference engine provider
//!
//! Face recognition, OCR, object detection and speech transcription run as
//! separate inference services. Each one accepts
//! `POST {"tool": NAME, "arguments": {...}}` and answers with a JSON object.
//! `"success": false` means the engine ran but produced nothing usable, and
//! an optional numeric `"confidence"` is picked up when present.

use async_trait::async_trait;
use judge_sdk::capability::CapabilityProvider;
use judge_sdk::errors::JudgeError;
use judge_sdk::types::{ProviderError, ProviderOutput, ToolArgs};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Provider backed by one inference endpoint
#[derive(Debug, Clone)]
pub struct HttpEngineProvider {
    name: String,
    endpoint: String,
    client: Client,
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    tool: &'a str,
    arguments: &'a ToolArgs,
}

impl HttpEngineProvider {
    /// Create a provider for `name` at `endpoint`.
    ///
    /// `timeout` bounds the HTTP exchange; the dispatcher enforces its own
    /// tool timeout on top.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, JudgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JudgeError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Interpret an engine response body
fn output_from_body(body: Value) -> Result<ProviderOutput, ProviderError> {
    let object = body
        .as_object()
        .ok_or_else(|| ProviderError::Failed("engine response is not a JSON object".to_string()))?;

    let success = object
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let confidence = object.get("confidence").and_then(Value::as_f64);

    let mut output = if success {
        ProviderOutput::found(body.clone())
    } else {
        let detail = object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("engine reported no result")
            .to_string();
        ProviderOutput::not_found(detail, body.clone())
    };
    if let Some(confidence) = confidence {
        output = output.with_confidence(confidence);
    }
    Ok(output)
}

#[async_trait]
impl CapabilityProvider for HttpEngineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, args: &ToolArgs) -> Result<ProviderOutput, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EngineRequest {
                tool: &self.name,
                arguments: args,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else if e.is_connect() {
                    ProviderError::Unavailable(format!(
                        "cannot connect to {} engine at {}",
                        self.name, self.endpoint
                    ))
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    ProviderError::InvalidInput(text)
                }
                StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                    ProviderError::Unavailable(format!("HTTP {}", status.as_u16()))
                }
                _ => ProviderError::Failed(format!("HTTP {}: {}", status.as_u16(), text)),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Failed(format!("invalid engine response: {}", e)))?;

        output_from_body(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_body_with_confidence() {
        let output = output_from_body(json!({"faces": [{"name": "A"}], "confidence": 0.93})).unwrap();
        assert!(output.success);
        assert_eq!(output.confidence, Some(0.93));
        assert_eq!(output.payload["faces"][0]["name"], "A");
    }

    #[test]
    fn test_domain_failure_body() {
        let output = output_from_body(json!({"success": false, "error": "no faces detected"})).unwrap();
        assert!(!output.success);
        assert_eq!(output.detail.as_deref(), Some("no faces detected"));
    }

    #[test]
    fn test_non_object_body_is_provider_error() {
        assert!(matches!(
            output_from_body(json!(["text"])),
            Err(ProviderError::Failed(_))
        ));
    }
}
