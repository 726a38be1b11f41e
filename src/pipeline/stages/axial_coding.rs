//! Axial Coding Stage
//!
//! Relates open codes into categories: one gateway call proposes category
//! groupings over the active codebook, producing new parent codes and
//! re-parenting members under them. Always raises a review checkpoint; the
//! category structure is the main thing humans want to vet. The pipeline
//! auto-applies the delta when human review is disabled.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::gateway::{call_with_retry, CallOptions, SchemaDescriptor};
use crate::types::{Code, QualError, Result, ReviewItem, StateDelta};

use super::super::stage::{PipelineStage, StageContext, StageResult};

#[derive(Debug, Deserialize)]
struct CategoryProposal {
    categories: Vec<ProposedCategory>,
}

#[derive(Debug, Deserialize)]
struct ProposedCategory {
    name: String,
    definition: String,
    #[serde(default)]
    reasoning: String,
    members: Vec<String>,
}

fn category_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "category_proposal",
        json!({
            "type": "object",
            "required": ["categories"],
            "properties": {
                "categories": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "definition", "members"],
                        "properties": {
                            "name": {"type": "string"},
                            "definition": {"type": "string"},
                            "reasoning": {"type": "string"},
                            "members": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                }
            }
        }),
    )
}

pub struct AxialCodingStage;

#[async_trait]
impl PipelineStage for AxialCodingStage {
    fn name(&self) -> &'static str {
        "axial_coding"
    }

    #[instrument(skip_all, fields(stage = self.name()))]
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult> {
        // Open coding must have run; its output lists the discovered codes.
        ctx.require("open_codes")?;

        let state = ctx.state();
        let roots: Vec<&Code> = state.codebook.roots().collect();
        if roots.is_empty() {
            return Err(QualError::upstream_missing(self.name(), "active_codes"));
        }

        let mut prompt = String::from(
            "Group the following qualitative codes into higher-level categories. \
             Every category needs a name, a definition, and the member code names it covers. \
             Leave codes that fit no category ungrouped.\n\nCodes:\n",
        );
        for code in &roots {
            prompt.push_str(&format!("- {}: {}\n", code.name, code.definition));
        }

        let value = call_with_retry(
            ctx.gateway.as_ref(),
            &prompt,
            &category_schema(),
            &CallOptions::default(),
            &ctx.retry,
        )
        .await
        .map_err(QualError::from)?;
        let proposal: CategoryProposal = serde_json::from_value(value).map_err(|e| {
            QualError::Gateway(crate::types::GatewayError::MalformedOutput(format!(
                "category proposal payload: {}",
                e
            )))
        })?;

        let mut delta = StateDelta::default();
        let mut items = Vec::new();
        let mut grouped: Vec<Value> = Vec::new();
        for category in proposal.categories {
            let members: Vec<_> = category
                .members
                .iter()
                .filter_map(|name| state.codebook.find_by_name(name))
                .map(|c| c.id)
                .collect();
            if members.is_empty() {
                warn!(category = %category.name, "category with no resolvable members dropped");
                continue;
            }
            let parent = Code::discovered(
                &category.name,
                &category.definition,
                1.0,
                &category.reasoning,
            );
            let parent_id = parent.id;
            items.push(ReviewItem::new(
                self.name(),
                parent_id,
                format!(
                    "Category '{}' grouping {} code(s)",
                    category.name,
                    members.len()
                ),
            ));
            grouped.push(json!({
                "category": crate::types::normalize_code_name(&category.name),
                "member_count": members.len(),
            }));
            delta.new_codes.push(parent);
            for member in members {
                delta.parent_updates.push((member, Some(parent_id)));
            }
        }
        delta.outputs.insert("categories".into(), Value::Array(grouped));

        if items.is_empty() {
            // Nothing to review; the model produced no usable grouping.
            return Ok(StageResult::Completed(delta));
        }
        Ok(StageResult::NeedsReview { delta, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{RetryPolicy, ScriptedGateway};
    use crate::pipeline::methodology::Methodology;
    use crate::types::{ProjectState, StateDelta};
    use std::sync::Arc;

    fn seeded_state() -> ProjectState {
        let mut state = ProjectState::new("p", Methodology::GroundedTheory);
        let delta = StateDelta {
            new_codes: vec![
                Code::discovered("trust issues", "d1", 0.9, "r"),
                Code::discovered("isolation", "d2", 0.8, "r"),
            ],
            ..Default::default()
        };
        state.apply_delta(&delta).unwrap();
        state
            .stage_outputs
            .insert("open_codes".into(), json!(["trust_issues", "isolation"]));
        state
    }

    #[tokio::test]
    async fn test_requires_open_codes() {
        let mut state = seeded_state();
        state.stage_outputs.remove("open_codes");
        let ctx = StageContext::new(
            &state,
            "axial_coding",
            Arc::new(ScriptedGateway::queue(vec![])),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let err = AxialCodingStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, QualError::UpstreamMissing { .. }));
    }

    #[tokio::test]
    async fn test_groups_codes_and_raises_review() {
        let state = seeded_state();
        let gateway = ScriptedGateway::queue(vec![Ok(json!({
            "categories": [{
                "name": "relational strain",
                "definition": "breakdown of relationships",
                "reasoning": "both codes describe strain",
                "members": ["trust issues", "isolation"]
            }]
        }))]);
        let ctx = StageContext::new(
            &state,
            "axial_coding",
            Arc::new(gateway),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let result = AxialCodingStage.run(&ctx).await.unwrap();
        let StageResult::NeedsReview { delta, items } = result else {
            panic!("expected review checkpoint");
        };
        assert_eq!(delta.new_codes.len(), 1);
        assert_eq!(delta.parent_updates.len(), 2);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].stage, "axial_coding");
    }

    #[tokio::test]
    async fn test_unresolvable_members_dropped() {
        let state = seeded_state();
        let gateway = ScriptedGateway::queue(vec![Ok(json!({
            "categories": [{
                "name": "ghost category",
                "definition": "only unknown members",
                "members": ["does_not_exist"]
            }]
        }))]);
        let ctx = StageContext::new(
            &state,
            "axial_coding",
            Arc::new(gateway),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let result = AxialCodingStage.run(&ctx).await.unwrap();
        let StageResult::Completed(delta) = result else {
            panic!("expected completed (nothing reviewable)");
        };
        assert!(delta.new_codes.is_empty());
    }
}
