//! OpenAI-Compatible Gateway
//!
//! Chat Completions provider usable against OpenAI or any compatible
//! endpoint. API keys are held in `SecretString` and redacted from Debug.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::GatewayConfig;
use crate::types::{GatewayError, QualError, Result};

use super::{extract_json, CallOptions, GatewayResult, LlmGateway, SchemaDescriptor};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiGateway {
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGateway")
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAiGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                QualError::Config(
                    "OpenAI API key not found. Set OPENAI_API_KEY or provide in config".into(),
                )
            })?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Url::parse(&api_base)
            .map_err(|e| QualError::Config(format!("invalid api_base '{}': {}", api_base, e)))?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QualError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            api_base,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            client,
        })
    }

    /// Same endpoint, different model. Used by IRR multi-model passes.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            model: model.into(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: self.timeout,
            client: self.client.clone(),
        }
    }

    fn build_request(&self, prompt: &str, schema: &SchemaDescriptor, options: &CallOptions) -> ChatRequest {
        let schema_str = serde_json::to_string_pretty(&schema.schema)
            .unwrap_or_else(|_| schema.schema.to_string());
        let system = format!(
            "You are a qualitative research analyst. Always respond with valid JSON matching this schema:\n\n```json\n{}\n```\n\nRespond ONLY with valid JSON, no explanation.",
            schema_str
        );

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system,
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                },
            ],
            temperature: options.temperature.unwrap_or(self.temperature),
            seed: options.seed,
            max_tokens: Some(self.max_tokens),
            response_format: Some(ResponseFormat {
                format_type: "json_object".into(),
            }),
        }
    }

    fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> GatewayError {
        match status {
            429 => GatewayError::RateLimited { retry_after },
            _ => GatewayError::Provider(format!("OpenAI API error ({}): {}", status, body)),
        }
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn call(&self, prompt: &str, schema: &SchemaDescriptor) -> GatewayResult<Value> {
        self.call_with(prompt, schema, &CallOptions::default()).await
    }

    async fn call_with(
        &self,
        prompt: &str,
        schema: &SchemaDescriptor,
        options: &CallOptions,
    ) -> GatewayResult<Value> {
        debug!(model = %self.model, schema = %schema.name, "calling OpenAI-compatible endpoint");

        let request = self.build_request(prompt, schema, options);
        let url = format!("{}/chat/completions", self.api_base);

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::Provider(format!("request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body, retry_after));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedOutput(format!("unparseable response: {}", e)))?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| GatewayError::MalformedOutput("no content in response".into()))?;

        let value = extract_json(content)?;
        schema.validate(&value)?;
        Ok(value)
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limited() {
        let err =
            OpenAiGateway::classify_status(429, "slow down".into(), Some(Duration::from_secs(10)));
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_classify_server_error() {
        let err = OpenAiGateway::classify_status(503, "unavailable".into(), None);
        assert!(matches!(err, GatewayError::Provider(_)));
    }
}
