//! Tool argument schemas and provider input/output types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Arguments passed to a capability provider (a validated JSON object)
pub type ToolArgs = serde_json::Map<String, Value>;

/// JSON type a schema field accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Whether `value` is acceptable for this field type.
    ///
    /// Integers are accepted where a number is expected.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    /// Name of the JSON type of an arbitrary value, for error messages
    pub fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared argument of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldSpec {
    /// Create a required field
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            description: String::new(),
        }
    }

    /// Create an optional field
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            description: String::new(),
        }
    }

    /// Attach a human-readable description (shown to the reasoning backend)
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A single reason an argument object was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentProblem {
    NotAnObject { found: &'static str },
    Missing(String),
    WrongType {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
    Unexpected(String),
    MissingOneOf(Vec<String>),
}

impl fmt::Display for ArgumentProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentProblem::NotAnObject { found } => {
                write!(f, "arguments must be an object, found {}", found)
            }
            ArgumentProblem::Missing(field) => write!(f, "missing required field '{}'", field),
            ArgumentProblem::WrongType {
                field,
                expected,
                found,
            } => write!(
                f,
                "field '{}' must be {}, found {}",
                field, expected, found
            ),
            ArgumentProblem::Unexpected(field) => write!(f, "unexpected field '{}'", field),
            ArgumentProblem::MissingOneOf(fields) => {
                write!(f, "at least one of [{}] is required", fields.join(", "))
            }
        }
    }
}

/// Input schema of a tool: named, typed fields plus optional "any of" groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgSchema {
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Vec<String>>,
}

impl ArgSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            any_of: Vec::new(),
        }
    }

    /// Require that at least one of `names` is present
    pub fn require_any_of(mut self, names: &[&str]) -> Self {
        self.any_of
            .push(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate an argument value against the schema.
    ///
    /// Returns the validated object on success. On failure every problem is
    /// reported, in field declaration order followed by unexpected fields.
    pub fn validate(&self, args: &Value) -> Result<ToolArgs, Vec<ArgumentProblem>> {
        let empty = ToolArgs::new();
        let object = match args {
            Value::Object(map) => map,
            // A missing arguments object is read as "no arguments"
            Value::Null => &empty,
            other => {
                return Err(vec![ArgumentProblem::NotAnObject {
                    found: FieldType::describe(other),
                }])
            }
        };

        let mut problems = Vec::new();

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    problems.push(ArgumentProblem::Missing(field.name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.accepts(value) => {
                    problems.push(ArgumentProblem::WrongType {
                        field: field.name.clone(),
                        expected: field.field_type,
                        found: FieldType::describe(value),
                    });
                }
                Some(_) => {}
            }
        }

        let mut unexpected: Vec<&String> = object
            .keys()
            .filter(|key| self.field(key).is_none())
            .collect();
        unexpected.sort();
        problems.extend(
            unexpected
                .into_iter()
                .map(|key| ArgumentProblem::Unexpected(key.clone())),
        );

        for group in &self.any_of {
            let satisfied = group
                .iter()
                .any(|name| object.get(name).is_some_and(|v| !v.is_null()));
            if !satisfied {
                problems.push(ArgumentProblem::MissingOneOf(group.clone()));
            }
        }

        if problems.is_empty() {
            Ok(object.clone())
        } else {
            Err(problems)
        }
    }
}

/// Output from a capability provider
///
/// `success = false` here is a *domain* failure (the engine ran but found
/// nothing usable). Transport or engine errors are reported through
/// [`ProviderError`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub success: bool,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProviderOutput {
    /// A successful result carrying structured data
    pub fn found(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            confidence: None,
            detail: None,
        }
    }

    /// A domain failure: the provider ran but could not produce a finding
    pub fn not_found(detail: impl Into<String>, payload: Value) -> Self {
        Self {
            success: false,
            payload,
            confidence: None,
            detail: Some(detail.into()),
        }
    }

    /// Attach a confidence score, clamped to 0.0..=1.0
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// Errors a capability provider can raise
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out")]
    Timeout,

    #[error("provider rejected input: {0}")]
    InvalidInput(String),

    #[error("provider failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ocr_schema() -> ArgSchema {
        ArgSchema::new(vec![
            FieldSpec::required("image_url", FieldType::String),
            FieldSpec::optional("language", FieldType::String),
            FieldSpec::optional("min_confidence", FieldType::Number),
        ])
    }

    #[test]
    fn test_valid_arguments_pass() {
        let args = json!({"image_url": "https://cdn/x.jpg", "min_confidence": 1});
        let validated = ocr_schema().validate(&args).unwrap();
        assert_eq!(validated.len(), 2);
    }

    #[test]
    fn test_missing_and_mistyped_fields_are_all_reported() {
        let args = json!({"language": 5, "path": "/tmp/x"});
        let problems = ocr_schema().validate(&args).unwrap_err();

        assert_eq!(
            problems,
            vec![
                ArgumentProblem::Missing("image_url".to_string()),
                ArgumentProblem::WrongType {
                    field: "language".to_string(),
                    expected: FieldType::String,
                    found: "integer",
                },
                ArgumentProblem::Unexpected("path".to_string()),
            ]
        );
    }

    #[test]
    fn test_null_required_field_counts_as_missing() {
        let problems = ocr_schema()
            .validate(&json!({"image_url": null}))
            .unwrap_err();
        assert_eq!(problems, vec![ArgumentProblem::Missing("image_url".to_string())]);
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        let problems = ocr_schema().validate(&json!(["a"])).unwrap_err();
        assert_eq!(problems, vec![ArgumentProblem::NotAnObject { found: "array" }]);
    }

    #[test]
    fn test_any_of_group() {
        let schema = ArgSchema::new(vec![
            FieldSpec::optional("query", FieldType::String),
            FieldSpec::optional("image_url", FieldType::String),
        ])
        .require_any_of(&["query", "image_url"]);

        assert!(schema.validate(&json!({"query": "eiffel tower"})).is_ok());
        let problems = schema.validate(&json!({})).unwrap_err();
        assert_eq!(
            problems,
            vec![ArgumentProblem::MissingOneOf(vec![
                "query".to_string(),
                "image_url".to_string()
            ])]
        );
        assert_eq!(
            problems[0].to_string(),
            "at least one of [query, image_url] is required"
        );
    }

    #[test]
    fn test_provider_output_confidence_is_clamped() {
        let output = ProviderOutput::found(json!({"text": "PARIS"})).with_confidence(1.7);
        assert_eq!(output.confidence, Some(1.0));
        assert!(output.success);

        let miss = ProviderOutput::not_found("no faces", Value::Null);
        assert!(!miss.success);
        assert_eq!(miss.detail.as_deref(), Some("no faces"));
    }
}
