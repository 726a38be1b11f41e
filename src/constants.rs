//! Application Constants
//!
//! Central defaults. Runtime-tunable values live in `config`; these are the
//! fallbacks and fixed limits.

/// Saturation detection defaults (grounded theory "no new codes" criterion).
pub mod saturation {
    /// Growth rate below which a document contributes "no new codes".
    pub const GROWTH_THRESHOLD: f64 = 0.10;
    /// Consecutive quiet documents required to signal saturation.
    pub const CONSECUTIVE_STEPS: usize = 2;
}

/// Pipeline concurrency limits.
pub mod concurrency {
    /// Max documents coded concurrently within one stage.
    pub const MAX_DOCUMENT_CONCURRENCY: usize = 4;
}

/// Gateway retry defaults.
pub mod retry {
    /// Retries after the initial attempt, for retryable errors only.
    pub const MAX_RETRIES: usize = 3;
    pub const MIN_DELAY_MS: u64 = 500;
    pub const MAX_DELAY_SECS: u64 = 30;
}

/// Reliability engine defaults.
pub mod reliability {
    /// Default pass count for inter-rater reliability.
    pub const DEFAULT_PASSES: usize = 3;
    /// Temperature spread used by stability runs.
    pub const STABILITY_TEMPERATURE_STEP: f32 = 0.15;
}

/// Network defaults.
pub mod network {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
}

/// Theoretical sampling.
pub mod sampling {
    /// Application count at or below which a category counts as under-developed.
    pub const UNDERDEVELOPED_MAX_APPLICATIONS: usize = 3;
}
