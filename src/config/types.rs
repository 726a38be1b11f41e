//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/qualweave/) and project (.qualweave/) level
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{concurrency, network, retry, saturation};
use crate::gateway::RetryPolicy;
use crate::stats::SaturationConfig;
use crate::types::{QualError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// LLM gateway settings
    pub gateway: GatewayConfig,

    /// Coding pipeline settings
    pub pipeline: PipelineConfig,

    /// Saturation detection settings
    pub saturation: SaturationSettings,

    /// Persistence settings
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            gateway: GatewayConfig::default(),
            pipeline: PipelineConfig::default(),
            saturation: SaturationSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `QualError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.gateway.temperature) {
            return Err(QualError::Config(format!(
                "gateway temperature must be between 0.0 and 2.0, got {}",
                self.gateway.temperature
            )));
        }

        if self.gateway.timeout_secs == 0 {
            return Err(QualError::Config(
                "gateway timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.concurrency == 0 {
            return Err(QualError::Config(
                "pipeline concurrency must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.saturation.growth_threshold) {
            return Err(QualError::Config(format!(
                "saturation growth_threshold must be between 0.0 and 1.0, got {}",
                self.saturation.growth_threshold
            )));
        }

        if self.saturation.consecutive_steps == 0 {
            return Err(QualError::Config(
                "saturation consecutive_steps must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Gateway Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Provider name: "openai" or "ollama"
    pub provider: String,

    /// Model identifier (provider default when unset)
    pub model: Option<String>,

    /// API key; falls back to the provider's environment variable.
    /// Never serialized back out when printing configuration.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Endpoint base URL (provider default when unset)
    pub api_base: Option<String>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Default sampling temperature
    pub temperature: f32,

    /// Response token cap
    pub max_tokens: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_key: None,
            api_base: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max documents coded concurrently within one stage
    pub concurrency: usize,

    /// Pause at review checkpoints; `false` auto-approves stage proposals
    pub human_review: bool,

    /// Gateway retry settings
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: concurrency::MAX_DOCUMENT_CONCURRENCY,
            human_review: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt, for retryable errors only
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: retry::MAX_RETRIES,
            min_delay_ms: retry::MIN_DELAY_MS,
            max_delay_secs: retry::MAX_DELAY_SECS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_delay: std::time::Duration::from_millis(self.min_delay_ms),
            max_delay: std::time::Duration::from_secs(self.max_delay_secs),
        }
    }
}

// =============================================================================
// Saturation Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SaturationSettings {
    /// Growth rate below which a step contributes "no new codes"
    pub growth_threshold: f64,

    /// Consecutive quiet steps required to signal saturation
    pub consecutive_steps: usize,
}

impl Default for SaturationSettings {
    fn default() -> Self {
        Self {
            growth_threshold: saturation::GROWTH_THRESHOLD,
            consecutive_steps: saturation::CONSECUTIVE_STEPS,
        }
    }
}

impl SaturationSettings {
    pub fn detector_config(&self) -> SaturationConfig {
        SaturationConfig {
            growth_threshold: self.growth_threshold,
            consecutive_steps: self.consecutive_steps,
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path, relative to the project root
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".qualweave/qualweave.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.gateway.temperature = 3.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.pipeline.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_growth_threshold() {
        let mut config = Config::default();
        config.saturation.growth_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = Config::default();
        config.gateway.api_key = Some("sk-secret".to_string());
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_retry_config_to_policy() {
        let retry = RetryConfig {
            max_retries: 5,
            min_delay_ms: 100,
            max_delay_secs: 10,
        };
        let policy = retry.policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.min_delay, std::time::Duration::from_millis(100));
    }
}
