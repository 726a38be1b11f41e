//! LLM Gateway Abstraction
//!
//! Defines the `LlmGateway` trait: prompt in, schema-validated structured
//! JSON out, or a typed [`GatewayError`]. The pipeline never inspects prompt
//! text or raw provider payloads; it depends only on this contract.
//!
//! ## Modules
//!
//! - `openai`: OpenAI-compatible Chat Completions provider
//! - `ollama`: local Ollama provider
//! - `retry`: explicit retry combinator (Timeout/RateLimited only)
//! - `script`: deterministic scripted gateway for tests and dry runs

mod ollama;
mod openai;
pub mod retry;
pub mod script;

pub use ollama::OllamaGateway;
pub use openai::OpenAiGateway;
pub use retry::{call_with_retry, RetryPolicy};
pub use script::ScriptedGateway;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GatewayError, QualError, Result};

/// Result alias for gateway calls.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Shared gateway handle for concurrent access across pipeline stages.
pub type SharedGateway = Arc<dyn LlmGateway>;

// =============================================================================
// Schema Descriptor
// =============================================================================

/// Describes the structured output a call must produce.
///
/// Validation is shallow by intent: top-level required fields and their JSON
/// types. Stages deserialize into typed structs afterwards; this check exists
/// so a provider's malformed payload surfaces as `MalformedOutput` with a
/// useful message instead of a downstream serde error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Schema name, used in logs and error messages.
    pub name: String,
    /// JSON Schema object forwarded to the provider.
    pub schema: Value,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Validate a returned object against the schema's top-level
    /// `required` list and `properties` types.
    pub fn validate(&self, value: &Value) -> GatewayResult<()> {
        let obj = value.as_object().ok_or_else(|| {
            GatewayError::MalformedOutput(format!(
                "schema '{}': expected JSON object, got {}",
                self.name,
                type_name(value)
            ))
        })?;

        let properties = self.schema.get("properties").and_then(Value::as_object);
        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                let Some(actual) = obj.get(field) else {
                    return Err(GatewayError::MalformedOutput(format!(
                        "schema '{}': missing required field '{}'",
                        self.name, field
                    )));
                };
                if let Some(expected) = properties
                    .and_then(|p| p.get(field))
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                {
                    if !type_matches(expected, actual) {
                        return Err(GatewayError::MalformedOutput(format!(
                            "schema '{}': field '{}' expected {}, got {}",
                            self.name,
                            field,
                            expected,
                            type_name(actual)
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, actual: &Value) -> bool {
    match expected {
        "string" => actual.is_string(),
        "number" => actual.is_number(),
        "integer" => actual.is_i64() || actual.is_u64(),
        "boolean" => actual.is_boolean(),
        "array" => actual.is_array(),
        "object" => actual.is_object(),
        "null" => actual.is_null(),
        _ => true,
    }
}

// =============================================================================
// Call Options
// =============================================================================

/// Per-call sampling overrides. Stability runs vary only these, keeping the
/// prompt and model fixed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub seed: Option<u64>,
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// LLM gateway contract: `call(prompt, schema)` returns either a
/// schema-valid object or a typed failure. Timeouts are the gateway's
/// responsibility; the pipeline treats them as failed outcomes.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Issue one call and validate the structured response.
    async fn call(&self, prompt: &str, schema: &SchemaDescriptor) -> GatewayResult<Value>;

    /// Issue one call with sampling overrides. Providers that cannot honor
    /// an override ignore it; the default delegates to `call`.
    async fn call_with(
        &self,
        prompt: &str,
        schema: &SchemaDescriptor,
        _options: &CallOptions,
    ) -> GatewayResult<Value> {
        self.call(prompt, schema).await
    }

    /// Gateway name for logging.
    fn name(&self) -> &str;

    /// Model currently in use.
    fn model(&self) -> &str;
}

// =============================================================================
// Response Extraction
// =============================================================================

/// Extract the JSON object from a model reply that may wrap it in a
/// markdown fence or leading prose.
pub fn extract_json(content: &str) -> GatewayResult<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Fenced block: ```json ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Ok(value);
            }
        }
    }

    // Last resort: outermost brace pair.
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    Err(GatewayError::MalformedOutput(format!(
        "no parseable JSON in response ({} chars)",
        content.len()
    )))
}

/// Build a gateway from configuration.
pub fn build_gateway(config: &crate::config::GatewayConfig) -> Result<SharedGateway> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiGateway::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGateway::new(config)?)),
        other => Err(QualError::Config(format!(
            "unknown gateway provider '{}' (expected 'openai' or 'ollama')",
            other
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
