//! Ollama Gateway
//!
//! Local model provider via the Ollama HTTP API. No API key; honors
//! temperature and seed overrides through Ollama's `options` object.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::types::{GatewayError, QualError, Result};

use super::{extract_json, CallOptions, GatewayResult, LlmGateway, SchemaDescriptor};

const DEFAULT_API_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1";

#[derive(Debug)]
pub struct OllamaGateway {
    api_base: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QualError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: config.temperature,
            timeout,
            client,
        })
    }
}

#[async_trait]
impl LlmGateway for OllamaGateway {
    async fn call(&self, prompt: &str, schema: &SchemaDescriptor) -> GatewayResult<Value> {
        self.call_with(prompt, schema, &CallOptions::default()).await
    }

    async fn call_with(
        &self,
        prompt: &str,
        schema: &SchemaDescriptor,
        options: &CallOptions,
    ) -> GatewayResult<Value> {
        debug!(model = %self.model, schema = %schema.name, "calling Ollama");

        let schema_str = serde_json::to_string_pretty(&schema.schema)
            .unwrap_or_else(|_| schema.schema.to_string());
        let full_prompt = format!(
            "{}\n\nRespond ONLY with valid JSON matching this schema:\n{}",
            prompt, schema_str
        );

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: full_prompt,
            stream: false,
            format: "json".into(),
            options: GenerateOptions {
                temperature: options.temperature.unwrap_or(self.temperature),
                seed: options.seed,
            },
        };

        let url = format!("{}/api/generate", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::Provider(format!("Ollama request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider(format!(
                "Ollama API error ({}): {}",
                status, body
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedOutput(format!("unparseable response: {}", e)))?;

        let value = extract_json(&body.response)?;
        schema.validate(&value)?;
        Ok(value)
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}
