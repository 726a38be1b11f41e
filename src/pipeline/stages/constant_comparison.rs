//! Constant Comparison Stage
//!
//! Incremental coding in the grounded-theory sense: each segment is compared
//! against the evolving codebook, and the model makes a three-way decision:
//! significant difference → new code; minor difference → refine an existing
//! code's definition; otherwise → apply an existing code.
//!
//! Segments within one document are processed strictly in order (later
//! segments see the codebook produced by earlier ones). Documents are
//! independent and fan out in chunks up to the configured concurrency limit;
//! after each chunk fans back in, the saturation detector decides whether to
//! continue or halt early and flag the project as saturated.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::gateway::{call_with_retry, CallOptions, LlmGateway, RetryPolicy, SchemaDescriptor};
use crate::stats::saturation::{SaturationDetector, SaturationSignal};
use crate::types::{
    normalize_code_name, Code, Codebook, CodeApplication, CodeId, Document, QualError, Result,
    Segment, Span, StateDelta,
};

use super::super::stage::{PipelineStage, StageContext, StageResult};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SegmentDecision {
    action: DecisionAction,
    #[serde(default)]
    code_name: String,
    #[serde(default)]
    definition: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    quote: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DecisionAction {
    ApplyExisting,
    RefineDefinition,
    CreateNew,
    /// Segment carries nothing codable.
    Skip,
}

fn decision_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "segment_decision",
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["apply_existing", "refine_definition", "create_new", "skip"]
                },
                "code_name": {"type": "string"},
                "definition": {"type": "string"},
                "confidence": {"type": "number"},
                "reasoning": {"type": "string"},
                "quote": {"type": "string"}
            }
        }),
    )
}

// =============================================================================
// Per-Document Coder
// =============================================================================

/// Accumulated output of coding one document segment-by-segment.
#[derive(Debug, Default)]
struct DocOutcome {
    new_codes: Vec<Code>,
    definition_updates: Vec<(CodeId, String)>,
    applications: Vec<CodeApplication>,
}

/// Codes one document's segments strictly in order. The `registry` is shared
/// across concurrently coded documents so the same code name resolves to one
/// id; `local_codes` carries this document's own discoveries into later
/// segments' prompts.
async fn code_document(
    gateway: &dyn LlmGateway,
    doc: &Document,
    base: &Codebook,
    registry: &DashMap<String, CodeId>,
    retry: &RetryPolicy,
) -> Result<DocOutcome> {
    let mut outcome = DocOutcome::default();
    let schema = decision_schema();

    for segment in &doc.segments {
        let prompt = build_segment_prompt(doc, segment, base, &outcome.new_codes);
        let value = call_with_retry(gateway, &prompt, &schema, &CallOptions::default(), retry)
            .await
            .map_err(QualError::from)?;
        let decision: SegmentDecision = serde_json::from_value(value).map_err(|e| {
            QualError::Gateway(crate::types::GatewayError::MalformedOutput(format!(
                "segment decision payload: {}",
                e
            )))
        })?;

        apply_decision(doc, segment, decision, base, registry, &mut outcome)?;
    }
    Ok(outcome)
}

/// Pairs the document with its outcome for the fan-out. The closure feeding
/// `buffered` must return a nameable future; an inline async block borrowing
/// the document fails higher-ranked lifetime inference.
async fn code_document_task<'a>(
    gateway: &dyn LlmGateway,
    doc: &'a Document,
    base: &Codebook,
    registry: &DashMap<String, CodeId>,
    retry: &RetryPolicy,
) -> (&'a Document, Result<DocOutcome>) {
    let outcome = code_document(gateway, doc, base, registry, retry).await;
    (doc, outcome)
}

fn build_segment_prompt(
    doc: &Document,
    segment: &Segment,
    base: &Codebook,
    local_codes: &[Code],
) -> String {
    let mut prompt = String::from(
        "Compare this transcript segment against the current codebook. Decide: \
         apply_existing when an existing code fits; refine_definition when an existing \
         code almost fits but its definition needs broadening; create_new when the \
         segment expresses something significantly different; skip when nothing is codable. \
         Name the code and quote the supporting passage.\n\nCurrent codebook:\n",
    );
    for code in base.active_codes() {
        prompt.push_str(&format!("- {}: {}\n", code.name, code.definition));
    }
    for code in local_codes {
        prompt.push_str(&format!("- {}: {}\n", code.name, code.definition));
    }
    if base.active_count() == 0 && local_codes.is_empty() {
        prompt.push_str("(empty)\n");
    }
    if let Some(speaker) = &segment.speaker {
        prompt.push_str(&format!("\nSegment ({} in \"{}\"):\n", speaker, doc.title));
    } else {
        prompt.push_str(&format!("\nSegment (from \"{}\"):\n", doc.title));
    }
    prompt.push_str(&segment.text);
    prompt
}

fn apply_decision(
    doc: &Document,
    segment: &Segment,
    decision: SegmentDecision,
    base: &Codebook,
    registry: &DashMap<String, CodeId>,
    outcome: &mut DocOutcome,
) -> Result<()> {
    if decision.action == DecisionAction::Skip {
        return Ok(());
    }
    let normalized = normalize_code_name(&decision.code_name);
    if normalized.is_empty() {
        warn!(document = %doc.id, "decision without code name treated as skip");
        return Ok(());
    }

    let span = quote_span(segment, decision.quote.as_deref());
    let quote = decision
        .quote
        .clone()
        .unwrap_or_else(|| segment.text.clone());

    match decision.action {
        DecisionAction::Skip => unreachable!("handled above"),
        DecisionAction::CreateNew => {
            let code_id = match registry.get(&normalized) {
                // Model proposed a "new" code that already exists; apply instead.
                Some(entry) => *entry.value(),
                None => {
                    let code = Code::discovered(
                        decision.code_name.clone(),
                        decision.definition.clone(),
                        decision.confidence,
                        decision.reasoning.clone(),
                    );
                    let id = *registry.entry(normalized).or_insert(code.id);
                    if id == code.id {
                        outcome.new_codes.push(code);
                    }
                    id
                }
            };
            outcome.applications.push(CodeApplication::new(
                code_id,
                doc.id,
                span,
                quote,
                base.version,
            ));
        }
        DecisionAction::ApplyExisting | DecisionAction::RefineDefinition => {
            let Some(code_id) = registry.get(&normalized).map(|e| *e.value()) else {
                warn!(
                    document = %doc.id,
                    code = %decision.code_name,
                    "decision references unknown code; treated as create_new"
                );
                let code = Code::discovered(
                    decision.code_name.clone(),
                    decision.definition.clone(),
                    decision.confidence,
                    decision.reasoning.clone(),
                );
                let id = *registry.entry(normalized).or_insert(code.id);
                if id == code.id {
                    outcome.new_codes.push(code);
                }
                outcome
                    .applications
                    .push(CodeApplication::new(id, doc.id, span, quote, base.version));
                return Ok(());
            };
            if decision.action == DecisionAction::RefineDefinition && !decision.definition.is_empty()
            {
                // Refinements of this document's own discoveries edit in place.
                if let Some(own) = outcome.new_codes.iter_mut().find(|c| c.id == code_id) {
                    own.definition = decision.definition.clone();
                } else {
                    outcome
                        .definition_updates
                        .push((code_id, decision.definition.clone()));
                }
            }
            outcome.applications.push(CodeApplication::new(
                code_id,
                doc.id,
                span,
                quote,
                base.version,
            ));
        }
    }
    Ok(())
}

/// Span of the quoted passage within the document; the whole segment when the
/// quote is absent or cannot be located.
fn quote_span(segment: &Segment, quote: Option<&str>) -> Span {
    if let Some(q) = quote {
        let q = q.trim();
        if let Some(idx) = segment.text.find(q) {
            let start = segment.span.start + idx;
            return Span::new(start, start + q.len());
        }
    }
    segment.span
}

// =============================================================================
// Stage
// =============================================================================

#[derive(Debug, Default)]
pub struct ConstantComparisonStage;

#[async_trait]
impl PipelineStage for ConstantComparisonStage {
    fn name(&self) -> &'static str {
        "constant_comparison"
    }

    #[instrument(skip_all, fields(stage = self.name()))]
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult> {
        let state = ctx.state();
        let documents: Vec<&Document> = state.uncoded_documents().collect();
        if documents.is_empty() {
            return Err(QualError::upstream_missing(self.name(), "uncoded_documents"));
        }
        if let Some(unsegmented) = documents.iter().find(|d| d.segments.is_empty()) {
            return Err(QualError::upstream_missing(
                self.name(),
                &format!("segments for document {}", unsegmented.id),
            ));
        }

        let base = &state.codebook;
        let registry: DashMap<String, CodeId> = DashMap::new();
        for code in base.active_codes() {
            registry.insert(code.normalized_name(), code.id);
        }

        let detector = SaturationDetector::new(ctx.saturation);
        let mut delta = StateDelta::default();
        let mut signals: Vec<SaturationSignal> = Vec::new();
        // Running name set for saturation comparison across documents.
        let mut running_names: BTreeSet<String> = base.active_name_set();
        let mut consecutive_below = 0usize;
        let mut saturated = false;

        // Documents fan out chunk-by-chunk; segments within each document
        // stay strictly sequential inside code_document.
        for chunk in documents.chunks(ctx.concurrency.max(1)) {
            // Futures are built eagerly (they are inert until polled) so no
            // closure type is held across an await; a stream `map` closure
            // here trips rustc's "implementation of `FnOnce` is not general
            // enough" false positive under #[instrument].
            let tasks: Vec<_> = chunk
                .iter()
                .copied()
                .map(|doc| {
                    code_document_task(ctx.gateway.as_ref(), doc, base, &registry, &ctx.retry)
                })
                .collect();
            let outcomes: Vec<(&Document, Result<DocOutcome>)> = futures::stream::iter(tasks)
                .buffered(ctx.concurrency.max(1))
                .collect()
                .await;

            // Fan back in: fold outcomes in document order, emitting one
            // saturation signal per document.
            for (doc, outcome) in outcomes {
                let outcome = outcome?;
                let mut after = running_names.clone();
                after.extend(outcome.new_codes.iter().map(|c| c.normalized_name()));

                let signal = saturation_step(
                    &detector,
                    &running_names,
                    &after,
                    base.version + 1,
                    consecutive_below,
                );
                consecutive_below = if signal.below_threshold {
                    consecutive_below + 1
                } else {
                    0
                };
                debug!(
                    document = %doc.id,
                    new_codes = signal.new_code_count,
                    growth = signal.growth_rate,
                    "constant comparison document done"
                );
                saturated = signal.saturated;
                signals.push(signal);
                running_names = after;

                delta.new_codes.extend(outcome.new_codes);
                delta.definition_updates.extend(outcome.definition_updates);
                delta.new_applications.extend(outcome.applications);
                delta.mark_coded.push(doc.id);

                if saturated {
                    break;
                }
            }
            if saturated {
                info!("saturation reached; halting before remaining documents");
                break;
            }
        }

        delta.mark_saturated = saturated;
        delta.outputs.insert(
            "saturation_log".into(),
            serde_json::to_value(&signals)?,
        );
        delta
            .outputs
            .insert("incremental_codes".into(), Value::Array(
                delta
                    .new_codes
                    .iter()
                    .map(|c| Value::String(c.normalized_name()))
                    .collect(),
            ));
        Ok(StageResult::Completed(delta))
    }
}

/// Saturation step over raw name sets (the running codebook exists only as a
/// name set while the stage is in flight).
fn saturation_step(
    detector: &SaturationDetector,
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
    version: u64,
    consecutive_below: usize,
) -> SaturationSignal {
    let mut prev = Codebook::new();
    let mut curr = Codebook::new();
    curr.version = version;
    for name in before {
        // Definitions are irrelevant to the name-set comparison.
        let _ = prev.insert(Code::discovered(name.clone(), "", 1.0, ""));
    }
    for name in after {
        let _ = curr.insert(Code::discovered(name.clone(), "", 1.0, ""));
    }
    detector.step(&prev, &curr, consecutive_below)
}

// =============================================================================
// Tests
// =============================================================================
