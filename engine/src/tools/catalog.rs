//! Built-in tool catalog
//!
//! Schemas and descriptions of the analysis tools the judge knows about, and
//! construction of the shared registry from the `[[tools]]` config entries.

use judge_sdk::capability::CapabilityProvider;
use judge_sdk::errors::JudgeError;
use judge_sdk::types::{ArgSchema, FieldSpec, FieldType};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::http::HttpEngineProvider;
use super::search::WebSearchProvider;
use super::{ToolLimits, ToolRegistry, ToolSpec};
use crate::config::{Config, ToolKind};

/// Description and schema of a built-in tool
pub fn builtin(name: &str) -> Option<(&'static str, ArgSchema)> {
    let image = || {
        FieldSpec::required("image_url", FieldType::String).describe("URL of the image to analyse")
    };

    match name {
        "face_recognition" => Some((
            "Detect faces in an image and match them against known identities.",
            ArgSchema::new(vec![image()]),
        )),
        "ocr" => Some((
            "Extract printed or handwritten text from an image.",
            ArgSchema::new(vec![image()]),
        )),
        "object_detection" => Some((
            "Detect objects, symbols and flags in an image.",
            ArgSchema::new(vec![
                image(),
                FieldSpec::optional("min_confidence", FieldType::Number)
                    .describe("Drop detections below this score (0-1)"),
            ]),
        )),
        "speech_transcription" => Some((
            "Transcribe speech in an audio or video track.",
            ArgSchema::new(vec![
                FieldSpec::required("audio_url", FieldType::String)
                    .describe("URL of the audio or video file"),
                FieldSpec::optional("language", FieldType::String)
                    .describe("Language hint, e.g. 'en' or 'zh'"),
            ]),
        )),
        "web_search" => Some((
            "Search the web by keywords, or by image for reverse image search. \
             Use it to verify identities, flags, places and news facts.",
            ArgSchema::new(vec![
                FieldSpec::optional("query", FieldType::String)
                    .describe("Keywords, e.g. a person's name or an event"),
                FieldSpec::optional("image_url", FieldType::String)
                    .describe("Image to search by"),
                FieldSpec::optional("max_results", FieldType::Integer)
                    .describe("Number of matches to return"),
            ])
            .require_any_of(&["query", "image_url"]),
        )),
        _ => None,
    }
}

/// Build the registry from configuration.
///
/// Disabled tools are skipped. Every configured name must be a built-in.
pub fn registry_from_config(config: &Config) -> Result<ToolRegistry, JudgeError> {
    let mut registry = ToolRegistry::new();

    for tool in config.tools.iter().filter(|t| t.enabled) {
        let (description, schema) = builtin(&tool.name).ok_or_else(|| {
            JudgeError::Config(format!("Tool '{}' has no built-in schema", tool.name))
        })?;
        let timeout = Duration::from_secs(tool.timeout_secs);

        let provider: Arc<dyn CapabilityProvider> = match tool.kind {
            ToolKind::Http => {
                let endpoint = tool.endpoint.as_deref().ok_or_else(|| {
                    JudgeError::Config(format!("Tool '{}' needs an endpoint", tool.name))
                })?;
                Arc::new(HttpEngineProvider::new(&tool.name, endpoint, timeout)?)
            }
            ToolKind::Search => Arc::new(WebSearchProvider::from_config(&config.search, timeout)?),
        };

        registry.register(
            ToolSpec::new(&tool.name, description, schema, provider)
                .with_limits(ToolLimits::from(tool)),
        )?;
    }

    info!("Tool registry ready: {}", registry.names().join(", "));
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_builds_full_catalog() {
        let mut config = Config::default_config();
        config.tools[1].enabled = false;

        let registry = registry_from_config(&config).unwrap();
        assert_eq!(
            registry.names(),
            vec!["face_recognition", "object_detection", "speech_transcription", "web_search"]
        );
    }

    #[test]
    fn test_unknown_tool_name_rejected() {
        let mut config = Config::default_config();
        config.tools[0].name = "lie_detector".to_string();

        assert!(matches!(
            registry_from_config(&config),
            Err(JudgeError::Config(_))
        ));
    }

    #[test]
    fn test_web_search_needs_query_or_image() {
        let (_, schema) = builtin("web_search").unwrap();
        assert!(schema.validate(&json!({"image_url": "https://x"})).is_ok());
        assert!(schema.validate(&json!({"max_results": 3})).is_err());
    }
}
