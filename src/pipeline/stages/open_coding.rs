//! Open Coding Stage
//!
//! Initial per-document code discovery. Documents are independent units, so
//! they fan out across a bounded worker pool; a lock-free shared registry
//! keeps concurrently discovered codes with the same normalized name from
//! producing duplicates.
//!
//! The pass runner is shared with the reliability engine, which re-runs the
//! same pass N times under prompt perturbation or different models.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::gateway::{call_with_retry, CallOptions, LlmGateway, RetryPolicy, SchemaDescriptor};
use crate::types::{
    Code, Codebook, CodeApplication, CodeId, Document, QualError, Result, Span, StateDelta,
};

use super::super::stage::{PipelineStage, StageContext, StageResult};

// =============================================================================
// Response Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct DocumentCoding {
    codes: Vec<ProposedCode>,
}

#[derive(Debug, Deserialize)]
struct ProposedCode {
    name: String,
    definition: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    applications: Vec<ProposedApplication>,
}

#[derive(Debug, Deserialize)]
struct ProposedApplication {
    quote: String,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    end: Option<usize>,
}

pub(crate) fn coding_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "document_coding",
        json!({
            "type": "object",
            "required": ["codes"],
            "properties": {
                "codes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "definition"],
                        "properties": {
                            "name": {"type": "string"},
                            "definition": {"type": "string"},
                            "confidence": {"type": "number"},
                            "reasoning": {"type": "string"},
                            "applications": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["quote"],
                                    "properties": {
                                        "quote": {"type": "string"},
                                        "start": {"type": "integer"},
                                        "end": {"type": "integer"}
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }),
    )
}

// =============================================================================
// Pass Runner
// =============================================================================

/// Result of one full coding pass over a document set.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    /// Codes not present in the base codebook.
    pub new_codes: Vec<Code>,
    pub applications: Vec<CodeApplication>,
}

impl PassOutcome {
    /// The pass's full codebook: base plus discoveries, one version ahead.
    pub fn codebook(&self, base: &Codebook) -> Result<Codebook> {
        let mut book = base.successor();
        for code in &self.new_codes {
            book.insert(code.clone())?;
        }
        Ok(book)
    }
}

fn build_prompt(doc: &Document, base: &Codebook, perturbation: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(framing) = perturbation {
        prompt.push_str(framing);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "Perform open coding on the interview transcript below. Identify codes \
         (short conceptual labels), define each, and quote every passage the code applies to \
         with character offsets into the transcript.\n",
    );
    if base.active_count() > 0 {
        prompt.push_str("\nExisting codes (reuse names where the concept matches):\n");
        for code in base.active_codes() {
            prompt.push_str(&format!("- {}: {}\n", code.name, code.definition));
        }
    }
    prompt.push_str(&format!(
        "\nTranscript \"{}\":\n---\n{}\n---\n",
        doc.title, doc.text
    ));
    prompt
}

/// Resolve a proposed application's span: trust offsets when they match the
/// quote, otherwise locate the quote in the text. Unlocatable quotes are
/// dropped with a warning; they cannot be anchored to the document.
fn resolve_span(doc: &Document, app: &ProposedApplication) -> Option<Span> {
    if let (Some(start), Some(end)) = (app.start, app.end) {
        if start < end && end <= doc.text.len() && doc.text.is_char_boundary(start) && doc.text.is_char_boundary(end) {
            return Some(Span::new(start, end));
        }
    }
    doc.text
        .find(app.quote.trim())
        .map(|start| Span::new(start, start + app.quote.trim().len()))
}

/// Gateway round trip for one document. The fan-out closure must return a
/// nameable future; an inline async block borrowing the document fails
/// higher-ranked lifetime inference.
async fn code_one_document<'a>(
    gateway: &dyn LlmGateway,
    doc: &'a Document,
    base: &Codebook,
    perturbation: Option<&str>,
    options: &CallOptions,
    retry: &RetryPolicy,
    schema: &SchemaDescriptor,
) -> Result<(&'a Document, DocumentCoding)> {
    let prompt = build_prompt(doc, base, perturbation);
    let value = call_with_retry(gateway, &prompt, schema, options, retry)
        .await
        .map_err(QualError::from)?;
    Ok((doc, parse_coding(value)?))
}

/// Code every document once, fanning out up to `concurrency` documents.
///
/// A shared registry maps normalized code names to ids so the same concept
/// discovered in two documents concurrently resolves to one code. Fails fast
/// on the first document whose gateway call fails.
pub async fn run_coding_pass(
    gateway: &dyn LlmGateway,
    documents: &[&Document],
    base: &Codebook,
    perturbation: Option<&str>,
    options: CallOptions,
    retry: &RetryPolicy,
    concurrency: usize,
) -> Result<PassOutcome> {
    // Seed the registry with the base codebook's active names.
    let registry: DashMap<String, CodeId> = DashMap::new();
    for code in base.active_codes() {
        registry.insert(code.normalized_name(), code.id);
    }

    let schema = coding_schema();
    // Futures are built eagerly (they are inert until polled) so no closure
    // type is held across an await; a `map` closure here trips rustc's
    // "implementation of `FnOnce` is not general enough" false positive when
    // the caller is wrapped by #[instrument].
    let calls: Vec<_> = documents
        .iter()
        .copied()
        .map(|doc| code_one_document(gateway, doc, base, perturbation, &options, retry, &schema))
        .collect();
    let mut stream = futures::stream::iter(calls).buffer_unordered(concurrency.max(1));

    let mut outcome = PassOutcome::default();
    while let Some(result) = stream.next().await {
        let (doc, coding) = result?;
        debug!(document = %doc.id, codes = coding.codes.len(), "document coded");
        for proposed in coding.codes {
            let normalized = crate::types::normalize_code_name(&proposed.name);
            if normalized.is_empty() {
                warn!(document = %doc.id, "skipping code with empty name");
                continue;
            }
            let code_id = match registry.get(&normalized) {
                Some(entry) => *entry.value(),
                None => {
                    let code = Code::discovered(
                        proposed.name.clone(),
                        proposed.definition.clone(),
                        proposed.confidence,
                        proposed.reasoning.clone(),
                    );
                    let id = *registry.entry(normalized).or_insert(code.id);
                    if id == code.id {
                        outcome.new_codes.push(code);
                    }
                    id
                }
            };
            for app in &proposed.applications {
                match resolve_span(doc, app) {
                    Some(span) => outcome.applications.push(CodeApplication::new(
                        code_id,
                        doc.id,
                        span,
                        app.quote.trim(),
                        base.version,
                    )),
                    None => warn!(
                        document = %doc.id,
                        code = %proposed.name,
                        "dropping application with unlocatable quote"
                    ),
                }
            }
        }
    }
    Ok(outcome)
}

fn parse_coding(value: Value) -> Result<DocumentCoding> {
    serde_json::from_value(value).map_err(|e| {
        QualError::Gateway(crate::types::GatewayError::MalformedOutput(format!(
            "document coding payload: {}",
            e
        )))
    })
}

// =============================================================================
// Stage
// =============================================================================

pub struct OpenCodingStage;

#[async_trait]
impl PipelineStage for OpenCodingStage {
    fn name(&self) -> &'static str {
        "open_coding"
    }

    #[instrument(skip_all, fields(stage = self.name()))]
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult> {
        let state = ctx.state();
        let documents: Vec<&Document> = state.uncoded_documents().collect();
        if documents.is_empty() {
            return Err(QualError::upstream_missing(self.name(), "uncoded_documents"));
        }

        let outcome = run_coding_pass(
            ctx.gateway.as_ref(),
            &documents,
            &state.codebook,
            None,
            CallOptions::default(),
            &ctx.retry,
            ctx.concurrency,
        )
        .await?;

        let mut delta = StateDelta {
            new_codes: outcome.new_codes,
            new_applications: outcome.applications,
            mark_coded: documents.iter().map(|d| d.id).collect(),
            ..Default::default()
        };
        let names: Vec<Value> = delta
            .new_codes
            .iter()
            .map(|c| Value::String(c.normalized_name()))
            .collect();
        delta.outputs.insert("open_codes".into(), Value::Array(names));
        Ok(StageResult::Completed(delta))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;
    use crate::pipeline::methodology::Methodology;
    use crate::types::ProjectState;

    fn coding_response(name: &str, quote: &str) -> Value {
        json!({
            "codes": [{
                "name": name,
                "definition": format!("definition of {name}"),
                "confidence": 0.8,
                "reasoning": "seen in text",
                "applications": [{"quote": quote}]
            }]
        })
    }

    fn doc(title: &str, text: &str) -> Document {
        Document::new(title, text, vec![])
    }

    #[tokio::test]
    async fn test_pass_discovers_codes_and_anchors_quotes() {
        let d = doc("i1", "I just don't trust the process anymore.");
        let gateway = ScriptedGateway::with_handler(|_, _| {
            Ok(coding_response("trust issues", "don't trust the process"))
        });
        let base = Codebook::new();
        let outcome = run_coding_pass(
            &gateway,
            &[&d],
            &base,
            None,
            CallOptions::default(),
            &RetryPolicy::new(0),
            2,
        )
        .await
        .unwrap();

        assert_eq!(outcome.new_codes.len(), 1);
        assert_eq!(outcome.applications.len(), 1);
        let app = &outcome.applications[0];
        assert_eq!(&d.text[app.span.start..app.span.end], "don't trust the process");
    }

    #[tokio::test]
    async fn test_same_name_across_documents_shares_code() {
        let d1 = doc("i1", "trust was broken early");
        let d2 = doc("i2", "no trust left at all");
        let gateway = ScriptedGateway::with_handler(|prompt, _| {
            let quote = if prompt.contains("broken early") {
                "trust was broken"
            } else {
                "no trust left"
            };
            Ok(coding_response("Trust Issues", quote))
        });
        let base = Codebook::new();
        let outcome = run_coding_pass(
            &gateway,
            &[&d1, &d2],
            &base,
            None,
            CallOptions::default(),
            &RetryPolicy::new(0),
            2,
        )
        .await
        .unwrap();

        assert_eq!(outcome.new_codes.len(), 1, "one shared code");
        assert_eq!(outcome.applications.len(), 2);
        let id = outcome.new_codes[0].id;
        assert!(outcome.applications.iter().all(|a| a.code_id == id));
    }

    #[tokio::test]
    async fn test_existing_code_reused_not_rediscovered() {
        let d = doc("i1", "trust problems again");
        let mut base = Codebook::new();
        let existing = Code::discovered("trust issues", "d", 0.9, "r");
        let existing_id = existing.id;
        base.insert(existing).unwrap();

        let gateway = ScriptedGateway::with_handler(|_, _| {
            Ok(coding_response("trust_issues", "trust problems"))
        });
        let outcome = run_coding_pass(
            &gateway,
            &[&d],
            &base,
            None,
            CallOptions::default(),
            &RetryPolicy::new(0),
            1,
        )
        .await
        .unwrap();

        assert!(outcome.new_codes.is_empty());
        assert_eq!(outcome.applications[0].code_id, existing_id);
    }

    #[tokio::test]
    async fn test_gateway_failure_fails_pass() {
        let d = doc("i1", "text");
        let gateway =
            ScriptedGateway::always_err(|| crate::types::GatewayError::Provider("down".into()));
        let base = Codebook::new();
        let result = run_coding_pass(
            &gateway,
            &[&d],
            &base,
            None,
            CallOptions::default(),
            &RetryPolicy::new(0),
            1,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unlocatable_quote_dropped() {
        let d = doc("i1", "short text");
        let gateway = ScriptedGateway::with_handler(|_, _| {
            Ok(coding_response("theme", "this quote does not exist"))
        });
        let base = Codebook::new();
        let outcome = run_coding_pass(
            &gateway,
            &[&d],
            &base,
            None,
            CallOptions::default(),
            &RetryPolicy::new(0),
            1,
        )
        .await
        .unwrap();
        assert_eq!(outcome.new_codes.len(), 1);
        assert!(outcome.applications.is_empty());
    }

    #[tokio::test]
    async fn test_stage_requires_uncoded_documents() {
        let state = ProjectState::new("p", Methodology::GroundedTheory);
        let ctx = StageContext::new(
            &state,
            "open_coding",
            std::sync::Arc::new(ScriptedGateway::queue(vec![])),
            RetryPolicy::new(0),
            1,
            Default::default(),
        );
        let err = OpenCodingStage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, QualError::UpstreamMissing { .. }));
    }

    #[tokio::test]
    async fn test_stage_idempotent_delta_shape() {
        let mut state = ProjectState::new("p", Methodology::GroundedTheory);
        state.add_document(doc("i1", "trust was broken"));
        fn make_ctx(state: &ProjectState) -> StageContext<'_> {
            StageContext::new(
                state,
                "open_coding",
                std::sync::Arc::new(ScriptedGateway::with_handler(|_, _| {
                    Ok(coding_response("trust issues", "trust was broken"))
                })),
                RetryPolicy::new(0),
                1,
                Default::default(),
            )
        };

        // Two runs against the same snapshot: same codes/applications up to ids.
        let stage = OpenCodingStage;
        let ctx = make_ctx(&state);
        let r1 = stage.run(&ctx).await.unwrap();
        let r2 = stage.run(&ctx).await.unwrap();
        let (StageResult::Completed(d1), StageResult::Completed(d2)) = (r1, r2) else {
            panic!("expected completed results");
        };
        assert_eq!(d1.new_codes.len(), d2.new_codes.len());
        assert_eq!(d1.new_codes[0].name, d2.new_codes[0].name);
        assert_eq!(d1.new_applications[0].span, d2.new_applications[0].span);
        assert_eq!(d1.mark_coded, d2.mark_coded);
    }
}
