//! Analysis Pipeline
//!
//! Drives a project through its methodology's stage sequence. The pipeline
//! owns the `ProjectState` for the duration of a run and routes every
//! mutation through `apply_delta`, so a crash or stage failure never leaves
//! the state partially written.
//!
//! Review checkpoints suspend the run: the proposed delta is parked on the
//! state (`pending_delta`) together with the review queue, and the status
//! moves to `AwaitingReview`. A later `run` call resumes from the recorded
//! stage index once the review manager has resolved the queue. With human
//! review disabled, checkpoint deltas are applied as-is and the run
//! continues.

pub mod methodology;
pub mod stage;
pub mod stages;

use tracing::{error, info, instrument, warn};

use crate::gateway::{RetryPolicy, SharedGateway};
use crate::stats::saturation::SaturationConfig;
use crate::types::{PipelineStatus, ProjectState, Result, ReviewItem};

pub use methodology::{Methodology, StageKind};
pub use stage::{PipelineStage, StageContext, StageResult};

// =============================================================================
// Outcome
// =============================================================================

/// Terminal states of one `run` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every stage in the sequence completed.
    Done,
    /// A stage raised a review checkpoint; the run is suspended until the
    /// queued items are resolved.
    AwaitingReview {
        stage: String,
        items: Vec<ReviewItem>,
    },
    /// A stage failed. The failure is recorded on the project's progress so
    /// a persisted state explains itself.
    Failed {
        stage: String,
        kind: &'static str,
        detail: String,
    },
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct AnalysisPipeline {
    gateway: SharedGateway,
    retry: RetryPolicy,
    concurrency: usize,
    saturation: SaturationConfig,
    human_review: bool,
}

impl AnalysisPipeline {
    pub fn new(gateway: SharedGateway) -> Self {
        Self {
            gateway,
            retry: RetryPolicy::default(),
            concurrency: crate::constants::concurrency::MAX_DOCUMENT_CONCURRENCY,
            saturation: SaturationConfig::default(),
            human_review: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_saturation(mut self, saturation: SaturationConfig) -> Self {
        self.saturation = saturation;
        self
    }

    /// Disable review checkpoints; `NeedsReview` deltas apply immediately.
    pub fn with_human_review(mut self, enabled: bool) -> Self {
        self.human_review = enabled;
        self
    }

    /// Run (or resume) the stage sequence for `state`'s methodology.
    ///
    /// Starts from `state.progress.next_stage`, which is 0 for a fresh
    /// project and points past the checkpointed stage after a resolved
    /// review. Returns `AwaitingReview` immediately when unresolved review
    /// items are still queued.
    #[instrument(skip_all, fields(project = %state.id, methodology = %state.methodology))]
    pub async fn run(&self, state: &mut ProjectState) -> Result<PipelineOutcome> {
        if !state.review_queue.is_empty() {
            let stage = match &state.progress.status {
                PipelineStatus::AwaitingReview { stage } => stage.clone(),
                other => {
                    warn!(status = ?other, "review queue populated outside AwaitingReview");
                    String::new()
                }
            };
            return Ok(PipelineOutcome::AwaitingReview {
                stage,
                items: state.review_queue.clone(),
            });
        }

        let sequence = state.methodology.stage_sequence();
        while state.progress.next_stage < sequence.len() {
            let kind = sequence[state.progress.next_stage];
            let stage = kind.build();
            info!(stage = stage.name(), index = state.progress.next_stage, "running stage");
            state.progress.status = PipelineStatus::Running {
                stage: stage.name().to_string(),
            };

            let result = {
                let ctx = StageContext::new(
                    &*state,
                    stage.name(),
                    self.gateway.clone(),
                    self.retry,
                    self.concurrency,
                    self.saturation,
                );
                stage.run(&ctx).await
            };

            match result {
                Ok(StageResult::Completed(delta)) => {
                    state.apply_delta(&delta)?;
                    state.progress.next_stage += 1;
                }
                Ok(StageResult::NeedsReview { delta, items }) => {
                    if !self.human_review {
                        info!(
                            stage = stage.name(),
                            items = items.len(),
                            "review disabled; applying checkpoint delta"
                        );
                        state.apply_delta(&delta)?;
                        state.progress.next_stage += 1;
                        continue;
                    }
                    state.pending_delta = Some(delta);
                    state.review_queue = items.clone();
                    state.progress.status = PipelineStatus::AwaitingReview {
                        stage: stage.name().to_string(),
                    };
                    return Ok(PipelineOutcome::AwaitingReview {
                        stage: stage.name().to_string(),
                        items,
                    });
                }
                Err(err) => {
                    error!(stage = stage.name(), error = %err, "stage failed");
                    state.progress.status = PipelineStatus::Failed {
                        stage: stage.name().to_string(),
                        kind: err.kind().to_string(),
                    };
                    return Ok(PipelineOutcome::Failed {
                        stage: stage.name().to_string(),
                        kind: err.kind(),
                        detail: err.to_string(),
                    });
                }
            }
        }

        state.progress.status = PipelineStatus::Done;
        info!("pipeline complete");
        Ok(PipelineOutcome::Done)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;
    use crate::types::{Document, GatewayError};
    use serde_json::json;
    use std::sync::Arc;

    /// Handler that answers by schema name, so one gateway drives a whole
    /// multi-stage run.
    fn full_run_gateway() -> ScriptedGateway {
        ScriptedGateway::with_handler(|_, schema| match schema.name.as_str() {
            "document_coding" => Ok(json!({
                "codes": [{
                    "name": "trust issues",
                    "definition": "loss of trust",
                    "confidence": 0.8,
                    "reasoning": "stated directly",
                    "applications": [{"quote": "don't trust"}]
                }]
            })),
            "category_proposal" => Ok(json!({
                "categories": [{
                    "name": "relational strain",
                    "definition": "strained relationships",
                    "members": ["trust issues"]
                }]
            })),
            "core_selection" => Ok(json!({
                "core_category": "relational strain",
                "storyline": "strain runs through every account"
            })),
            other => Err(GatewayError::Provider(format!("unexpected schema {other}"))),
        })
    }

    fn project() -> ProjectState {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        state.add_document(Document::new(
            "i1",
            "Interviewer: How are things?\nP1: I just don't trust anyone now.",
            vec![],
        ));
        state
    }

    #[tokio::test]
    async fn test_full_run_without_review() {
        let mut state = project();
        let pipeline =
            AnalysisPipeline::new(Arc::new(full_run_gateway())).with_human_review(false);
        let outcome = pipeline.run(&mut state).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Done);
        assert_eq!(state.progress.status, PipelineStatus::Done);
        assert!(state.codebook.active_count() >= 2, "code plus category");
        assert!(state.stage_outputs.contains_key("core_category"));
        assert!(state.documents[0].coded);
        assert!(state.pending_delta.is_none());
    }

    #[tokio::test]
    async fn test_run_suspends_at_review_checkpoint() {
        let mut state = project();
        let pipeline = AnalysisPipeline::new(Arc::new(full_run_gateway()));
        let outcome = pipeline.run(&mut state).await.unwrap();
        let PipelineOutcome::AwaitingReview { stage, items } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(stage, "axial_coding");
        assert_eq!(items.len(), 1);
        assert!(state.pending_delta.is_some());
        assert_eq!(
            state.progress.status,
            PipelineStatus::AwaitingReview {
                stage: "axial_coding".into()
            }
        );
        // The checkpoint delta is parked, not applied: no category code yet.
        assert!(state.codebook.find_by_name("relational strain").is_none());
    }

    #[tokio::test]
    async fn test_rerun_while_awaiting_review_is_a_noop() {
        let mut state = project();
        let pipeline = AnalysisPipeline::new(Arc::new(full_run_gateway()));
        pipeline.run(&mut state).await.unwrap();
        let version = state.codebook.version;
        let outcome = pipeline.run(&mut state).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::AwaitingReview { .. }));
        assert_eq!(state.codebook.version, version);
    }

    #[tokio::test]
    async fn test_stage_failure_recorded_on_progress() {
        let mut state = project();
        let gateway =
            ScriptedGateway::always_err(|| GatewayError::Provider("model offline".into()));
        let pipeline = AnalysisPipeline::new(Arc::new(gateway)).with_human_review(false);
        let outcome = pipeline.run(&mut state).await.unwrap();
        let PipelineOutcome::Failed { stage, kind, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        // Segmentation is local; the first gateway-using stage fails.
        assert_eq!(stage, "open_coding");
        assert_eq!(kind, "provider_error");
        assert!(matches!(
            state.progress.status,
            PipelineStatus::Failed { .. }
        ));
        // Segmentation's delta committed before the failure.
        assert!(!state.documents[0].segments.is_empty());
    }

    #[tokio::test]
    async fn test_constant_comparison_methodology_runs() {
        let mut state = ProjectState::new("study", Methodology::ConstantComparison);
        state.add_document(Document::new("i1", "P1: trust is gone entirely.", vec![]));
        let gateway = ScriptedGateway::with_handler(|_, schema| {
            assert_eq!(schema.name, "segment_decision");
            Ok(json!({
                "action": "create_new",
                "code_name": "trust issues",
                "definition": "loss of trust",
                "confidence": 0.9,
                "reasoning": "stated"
            }))
        });
        let pipeline = AnalysisPipeline::new(Arc::new(gateway)).with_human_review(false);
        let outcome = pipeline.run(&mut state).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Done);
        assert_eq!(state.codebook.active_count(), 1);
        assert_eq!(state.applications.len(), 1);
    }
}
