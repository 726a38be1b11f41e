//! Selective Coding Stage
//!
//! Identifies the core category that integrates the category structure and
//! writes an integrative memo. The choice of core category is checkpointed
//! for human review.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use crate::gateway::{call_with_retry, CallOptions, SchemaDescriptor};
use crate::types::{Memo, QualError, Result, ReviewItem, StateDelta};

use super::super::stage::{PipelineStage, StageContext, StageResult};

#[derive(Debug, Deserialize)]
struct CoreSelection {
    core_category: String,
    #[serde(default)]
    storyline: String,
}

fn core_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "core_selection",
        json!({
            "type": "object",
            "required": ["core_category"],
            "properties": {
                "core_category": {"type": "string"},
                "storyline": {"type": "string"}
            }
        }),
    )
}

pub struct SelectiveCodingStage;

#[async_trait]
impl PipelineStage for SelectiveCodingStage {
    fn name(&self) -> &'static str {
        "selective_coding"
    }

    #[instrument(skip_all, fields(stage = self.name()))]
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult> {
        ctx.require("categories")?;

        let state = ctx.state();
        let mut prompt = String::from(
            "Select the single core category that best integrates this codebook, and \
             write a short storyline memo relating the other categories to it.\n\nCategories:\n",
        );
        for root in state.codebook.roots() {
            prompt.push_str(&format!("- {}: {}\n", root.name, root.definition));
            for child in state.codebook.children(&root.id) {
                prompt.push_str(&format!("    - {}\n", child.name));
            }
        }

        let value = call_with_retry(
            ctx.gateway.as_ref(),
            &prompt,
            &core_schema(),
            &CallOptions::default(),
            &ctx.retry,
        )
        .await
        .map_err(QualError::from)?;
        let selection: CoreSelection = serde_json::from_value(value).map_err(|e| {
            QualError::Gateway(crate::types::GatewayError::MalformedOutput(format!(
                "core selection payload: {}",
                e
            )))
        })?;

        let core = state
            .codebook
            .find_by_name(&selection.core_category)
            .ok_or_else(|| {
                QualError::Invariant(format!(
                    "core category '{}' not in active codebook",
                    selection.core_category
                ))
            })?;

        let mut delta = StateDelta::default();
        delta.outputs.insert(
            "core_category".into(),
            Value::String(core.normalized_name()),
        );
        if !selection.storyline.is_empty() {
            delta.memos.push(Memo::llm(selection.storyline));
        }

        let items = vec![ReviewItem::new(
            self.name(),
            core.id,
            format!("Core category selection: '{}'", core.name),
        )];
        Ok(StageResult::NeedsReview { delta, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{RetryPolicy, ScriptedGateway};
    use crate::pipeline::methodology::Methodology;
    use crate::types::{Code, ProjectState};
    use std::sync::Arc;

    fn state_with_category() -> ProjectState {
        let mut state = ProjectState::new("p", Methodology::GroundedTheory);
        let delta = StateDelta {
            new_codes: vec![Code::discovered("relational strain", "d", 1.0, "r")],
            ..Default::default()
        };
        state.apply_delta(&delta).unwrap();
        state.stage_outputs.insert("categories".into(), json!([]));
        state
    }

    #[tokio::test]
    async fn test_selects_core_and_memos_storyline() {
        let state = state_with_category();
        let gateway = ScriptedGateway::queue(vec![Ok(json!({
            "core_category": "relational strain",
            "storyline": "Everything ties back to strained relationships."
        }))]);
        let ctx = StageContext::new(
            &state,
            "selective_coding",
            Arc::new(gateway),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let result = SelectiveCodingStage.run(&ctx).await.unwrap();
        let StageResult::NeedsReview { delta, items } = result else {
            panic!("expected review checkpoint");
        };
        assert_eq!(
            delta.outputs.get("core_category"),
            Some(&json!("relational_strain"))
        );
        assert_eq!(delta.memos.len(), 1);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_core_category_is_invariant_error() {
        let state = state_with_category();
        let gateway = ScriptedGateway::queue(vec![Ok(json!({
            "core_category": "invented category"
        }))]);
        let ctx = StageContext::new(
            &state,
            "selective_coding",
            Arc::new(gateway),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let err = SelectiveCodingStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, QualError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_requires_categories_output() {
        let mut state = state_with_category();
        state.stage_outputs.remove("categories");
        let ctx = StageContext::new(
            &state,
            "selective_coding",
            Arc::new(ScriptedGateway::queue(vec![])),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let err = SelectiveCodingStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, QualError::UpstreamMissing { .. }));
    }
}
