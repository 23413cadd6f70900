//! Web search provider
//!
//! SerpApi-style search. With an `image_url` the provider runs a reverse
//! image search (`google_lens`), otherwise a keyword search (`google`).
//! Several API keys may be configured, comma separated; a key that is
//! rejected or out of quota is skipped for the next one.

use async_trait::async_trait;
use judge_sdk::capability::CapabilityProvider;
use judge_sdk::errors::JudgeError;
use judge_sdk::types::{ProviderError, ProviderOutput, ToolArgs};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::config::SearchConfig;

/// Provider for the `web_search` tool
#[derive(Debug)]
pub struct WebSearchProvider {
    endpoint: String,
    api_keys: Vec<String>,
    /// Index of the key to try first
    next_key: AtomicUsize,
    max_results: usize,
    client: Client,
}

impl WebSearchProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_keys: Vec<String>,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Self, JudgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JudgeError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_keys,
            next_key: AtomicUsize::new(0),
            max_results: max_results.max(1),
            client,
        })
    }

    /// Build from the `[search]` section, reading keys from the environment
    pub fn from_config(config: &SearchConfig, timeout: Duration) -> Result<Self, JudgeError> {
        let api_keys = std::env::var(&config.api_key_env)
            .map(|raw| parse_keys(&raw))
            .unwrap_or_default();
        if api_keys.is_empty() {
            warn!(
                "{} is not set; web_search calls will fail until it is",
                config.api_key_env
            );
        }
        Self::new(&config.endpoint, api_keys, config.max_results, timeout)
    }

    async fn search_with_key(
        &self,
        key: &str,
        params: &[(&str, String)],
    ) -> Result<Value, KeyOutcome> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(params)
            .query(&[("api_key", key)])
            .send()
            .await
            .map_err(|e| {
                KeyOutcome::Fatal(if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Unavailable(format!(
                        "search request failed: {}",
                        e.without_url()
                    ))
                })
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                Err(KeyOutcome::Rejected(response.status().as_u16()))
            }
            status if !status.is_success() => Err(KeyOutcome::Fatal(ProviderError::Failed(
                format!("search returned HTTP {}", status.as_u16()),
            ))),
            _ => response.json().await.map_err(|e| {
                KeyOutcome::Fatal(ProviderError::Failed(format!(
                    "invalid search response: {}",
                    e.without_url()
                )))
            }),
        }
    }
}

enum KeyOutcome {
    /// Try the next key
    Rejected(u16),
    Fatal(ProviderError),
}

fn parse_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Condense a search response into a payload of matches
fn summarize(engine: &str, data: &Value, max_results: usize) -> ProviderOutput {
    let list_key = if engine == "google_lens" {
        "visual_matches"
    } else {
        "organic_results"
    };

    let matches: Vec<Value> = data
        .get(list_key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item.get("title").and_then(Value::as_str)?.trim();
                    let link = item.get("link").and_then(Value::as_str)?;
                    if title.is_empty() {
                        return None;
                    }
                    Some(json!({
                        "title": title,
                        "link": link,
                        "source": item.get("source").and_then(Value::as_str),
                        "snippet": item.get("snippet").and_then(Value::as_str),
                    }))
                })
                .take(max_results)
                .collect()
        })
        .unwrap_or_default();

    let identified = data
        .get("knowledge_graph")
        .and_then(|kg| kg.get("title").or_else(|| kg.get(0).and_then(|k| k.get("title"))))
        .and_then(Value::as_str)
        .map(str::to_string);

    let payload = json!({
        "engine": engine,
        "identified": identified,
        "matches": matches,
    });

    if matches.is_empty() && identified.is_none() {
        let detail = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("no matches")
            .to_string();
        ProviderOutput::not_found(detail, payload)
    } else {
        ProviderOutput::found(payload)
    }
}

#[async_trait]
impl CapabilityProvider for WebSearchProvider {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn invoke(&self, args: &ToolArgs) -> Result<ProviderOutput, ProviderError> {
        if self.api_keys.is_empty() {
            return Err(ProviderError::Unavailable(
                "no search API key configured".to_string(),
            ));
        }

        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let image_url = args.get("image_url").and_then(Value::as_str);
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).clamp(1, 20))
            .unwrap_or(self.max_results);

        let (engine, mut params) = match image_url {
            Some(url) => ("google_lens", vec![("url", url.to_string())]),
            None if !query.trim().is_empty() => ("google", vec![("q", query.to_string())]),
            None => {
                return Err(ProviderError::InvalidInput(
                    "either query or image_url is required".to_string(),
                ))
            }
        };
        params.push(("engine", engine.to_string()));
        if image_url.is_some() && !query.trim().is_empty() {
            params.push(("q", query.to_string()));
        }
        if engine == "google" {
            params.push(("num", max_results.to_string()));
        }

        let start = self.next_key.load(Ordering::Relaxed);
        for offset in 0..self.api_keys.len() {
            let idx = (start + offset) % self.api_keys.len();
            match self.search_with_key(&self.api_keys[idx], &params).await {
                Ok(data) => {
                    self.next_key.store(idx, Ordering::Relaxed);
                    return Ok(summarize(engine, &data, max_results));
                }
                Err(KeyOutcome::Rejected(status)) => {
                    warn!("Search key #{} rejected with HTTP {}, rotating", idx + 1, status);
                }
                Err(KeyOutcome::Fatal(e)) => return Err(e),
            }
        }

        Err(ProviderError::Unavailable(
            "all search API keys were rejected or exhausted".to_string(),
        ))
    }
}
