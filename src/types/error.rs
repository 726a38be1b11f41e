//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//!
//! ## Taxonomy
//!
//! - **Gateway**: typed LLM gateway failures; `Timeout` and `RateLimited`
//!   are retryable with backoff, `MalformedOutput` and `Provider` are not
//! - **UpstreamMissing**: a stage required output a prior stage never produced
//! - **Invariant**: codebook invariant violations (unknown ids, cycles,
//!   incomplete partitions), always hard errors
//! - **Stats**: degenerate statistical inputs that must surface explicitly
//!   instead of fabricating numbers
//!
//! ## Design Principles
//!
//! - Single unified error type (QualError) for the entire application
//! - Fail loud: nothing is silently defaulted or skipped
//! - No panic/unwrap outside tests

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Gateway Errors
// =============================================================================

/// Typed failure from the LLM gateway.
///
/// The pipeline never inspects prompt text or raw provider payloads; it
/// routes purely on these variants.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The provider did not answer within its deadline.
    #[error("gateway timeout after {0:?}")]
    Timeout(Duration),

    /// The provider answered, but the payload failed schema validation.
    #[error("malformed gateway output: {0}")]
    MalformedOutput(String),

    /// The provider rejected the call due to rate limiting.
    #[error("gateway rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Any other provider-side failure (auth, 5xx, connectivity).
    #[error("provider error: {0}")]
    Provider(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {:?})", d),
        None => String::new(),
    }
}

impl GatewayError {
    /// Whether the caller may retry the same call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited { .. })
    }

    /// Suggested wait before the next attempt.
    pub fn recommended_delay(&self) -> Duration {
        match self {
            Self::RateLimited {
                retry_after: Some(d),
            } => *d,
            Self::RateLimited { retry_after: None } => Duration::from_secs(30),
            Self::Timeout(_) => Duration::from_secs(5),
            _ => Duration::from_millis(500),
        }
    }

    /// Short machine-readable kind tag, reported verbatim in pipeline outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::MalformedOutput(_) => "malformed_output",
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider(_) => "provider_error",
        }
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum QualError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Gateway
    // -------------------------------------------------------------------------
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------
    /// A stage required upstream data that was never produced (or was
    /// rejected). Fatal to the current run; never defaulted to empty.
    #[error("Stage '{stage}' requires missing upstream data '{key}'")]
    UpstreamMissing { stage: String, key: String },

    /// A stage failed; carries the stage name and error kind verbatim.
    #[error("Pipeline failed at stage '{stage}': [{kind}] {detail}")]
    Stage {
        stage: String,
        kind: String,
        detail: String,
    },

    /// The pipeline was asked to resume but is not awaiting review, or
    /// decisions do not cover the outstanding review items.
    #[error("Review error: {0}")]
    Review(String),

    // -------------------------------------------------------------------------
    // Codebook Invariants
    // -------------------------------------------------------------------------
    #[error("Unknown code id: {0}")]
    UnknownCode(String),

    #[error("Unknown document id: {0}")]
    UnknownDocument(String),

    /// Cyclic parent pointer, incomplete split partition, duplicate
    /// application ownership, and similar structural violations.
    #[error("Codebook invariant violated: {0}")]
    Invariant(String),

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------
    /// Degenerate statistical input (e.g. a single-pass reliability run).
    #[error("Statistics error: {0}")]
    Stats(String),

    // -------------------------------------------------------------------------
    // Config / Storage
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),
}

impl QualError {
    /// Create a stage failure carrying an error kind tag.
    pub fn stage(
        stage: impl Into<String>,
        kind: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Stage {
            stage: stage.into(),
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// Create an upstream-data-missing error.
    pub fn upstream_missing(stage: impl Into<String>, key: impl Into<String>) -> Self {
        Self::UpstreamMissing {
            stage: stage.into(),
            key: key.into(),
        }
    }

    /// The error kind tag surfaced in `PipelineOutcome::Failed`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Database(_) => "database",
            Self::Json(_) => "json",
            Self::Gateway(g) => g.kind(),
            Self::UpstreamMissing { .. } => "upstream_missing",
            Self::Stage { .. } => "stage",
            Self::Review(_) => "review",
            Self::UnknownCode(_) => "unknown_code",
            Self::UnknownDocument(_) => "unknown_document",
            Self::Invariant(_) => "invariant",
            Self::Stats(_) => "stats",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::ProjectNotFound(_) => "project_not_found",
        }
    }

    /// Whether the pipeline may retry the failing operation in place.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Gateway(g) if g.is_retryable())
    }
}

impl From<anyhow::Error> for QualError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return QualError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        // Context-wrapped errors mostly originate at the storage boundary
        QualError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QualError>;

// =============================================================================
// Context Extension
// =============================================================================

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| QualError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| QualError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_retryable() {
        assert!(GatewayError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(GatewayError::RateLimited { retry_after: None }.is_retryable());
        assert!(!GatewayError::MalformedOutput("bad json".into()).is_retryable());
        assert!(!GatewayError::Provider("503".into()).is_retryable());
    }

    #[test]
    fn test_gateway_recommended_delay() {
        let limited = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(limited.recommended_delay(), Duration::from_secs(120));

        let timeout = GatewayError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout.recommended_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_error_kind_tags() {
        let err = QualError::upstream_missing("axial_coding", "open_codes");
        assert_eq!(err.kind(), "upstream_missing");
        assert!(!err.is_recoverable());

        let err = QualError::Gateway(GatewayError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_recoverable());

        let err = QualError::Gateway(GatewayError::MalformedOutput("x".into()));
        assert_eq!(err.kind(), "malformed_output");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_stage_error_display() {
        let err = QualError::stage("open_coding", "timeout", "gateway timeout after 30s");
        assert_eq!(
            err.to_string(),
            "Pipeline failed at stage 'open_coding': [timeout] gateway timeout after 30s"
        );
    }
}
