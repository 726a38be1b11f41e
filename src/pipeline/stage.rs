//! Pipeline Stage Contract
//!
//! Each stage is polymorphic over one capability: `run(ctx) -> StageResult`.
//! The context exposes read-only project state plus `require`, which raises a
//! typed upstream-data-missing error instead of silently defaulting. A failed
//! stage is the `Err` arm of the returned `Result`; the pipeline surfaces the
//! stage name and error kind verbatim.
//!
//! Stages must be idempotent with respect to re-invocation on the same
//! snapshot: the pipeline may retry after a transient gateway failure, and
//! re-running must produce an equivalent delta (up to id regeneration).

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::{RetryPolicy, SharedGateway};
use crate::stats::saturation::SaturationConfig;
use crate::types::{ProjectState, QualError, Result, ReviewItem, StateDelta};

// =============================================================================
// Stage Context
// =============================================================================

/// Read access to project state plus the collaborators a stage may use.
/// Stages never mutate state directly; they describe changes in a delta.
pub struct StageContext<'a> {
    state: &'a ProjectState,
    stage_name: &'a str,
    pub gateway: SharedGateway,
    pub retry: RetryPolicy,
    /// Max documents processed concurrently within this stage.
    pub concurrency: usize,
    pub saturation: SaturationConfig,
}

impl<'a> StageContext<'a> {
    pub fn new(
        state: &'a ProjectState,
        stage_name: &'a str,
        gateway: SharedGateway,
        retry: RetryPolicy,
        concurrency: usize,
        saturation: SaturationConfig,
    ) -> Self {
        Self {
            state,
            stage_name,
            gateway,
            retry,
            concurrency,
            saturation,
        }
    }

    pub fn state(&self) -> &ProjectState {
        self.state
    }

    pub fn stage_name(&self) -> &str {
        self.stage_name
    }

    /// Fetch a named upstream output, failing loudly when absent.
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.state
            .stage_outputs
            .get(key)
            .ok_or_else(|| QualError::upstream_missing(self.stage_name, key))
    }
}

// =============================================================================
// Stage Result
// =============================================================================

/// Successful stage outcomes. Failure is the `Err` arm of `run`.
#[derive(Debug, Clone)]
pub enum StageResult {
    /// Stage finished; the pipeline commits the delta and advances.
    Completed(StateDelta),
    /// Stage proposes a delta but wants human confirmation first. The
    /// pipeline holds the delta unapplied and suspends.
    NeedsReview {
        delta: StateDelta,
        items: Vec<ReviewItem>,
    },
}

// =============================================================================
// Stage Trait
// =============================================================================

#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stable stage identifier used in progress tracking and errors.
    fn name(&self) -> &'static str;

    /// Execute against a state snapshot, producing a delta.
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;
    use crate::pipeline::methodology::Methodology;
    use std::sync::Arc;

    #[test]
    fn test_require_missing_raises_typed_error() {
        let state = ProjectState::new("p", Methodology::GroundedTheory);
        let gateway = Arc::new(ScriptedGateway::queue(vec![]));
        let ctx = StageContext::new(
            &state,
            "axial_coding",
            gateway,
            RetryPolicy::default(),
            2,
            SaturationConfig::default(),
        );
        let err = ctx.require("open_codes").unwrap_err();
        match err {
            QualError::UpstreamMissing { stage, key } => {
                assert_eq!(stage, "axial_coding");
                assert_eq!(key, "open_codes");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_require_present() {
        let mut state = ProjectState::new("p", Methodology::GroundedTheory);
        state
            .stage_outputs
            .insert("open_codes".into(), serde_json::json!(["a"]));
        let gateway = Arc::new(ScriptedGateway::queue(vec![]));
        let ctx = StageContext::new(
            &state,
            "axial_coding",
            gateway,
            RetryPolicy::default(),
            2,
            SaturationConfig::default(),
        );
        assert_eq!(ctx.require("open_codes").unwrap()[0], "a");
    }
}
