//! Reliability Engine
//!
//! Empirical reliability checks for LLM-assisted coding, built on repeated
//! coding passes over the same documents:
//!
//! - **Inter-rater reliability**: N independent passes, each with a perturbed
//!   prompt framing (or each on a different model), compared pairwise with
//!   Cohen's kappa and jointly with Fleiss' kappa.
//! - **Stability**: the same prompt and model re-run with varied sampling
//!   (seed and temperature), measuring how much the coding drifts.
//!
//! Passes are read-only with respect to the project: nothing here mutates the
//! codebook or the stored applications.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::constants::reliability::STABILITY_TEMPERATURE_STEP;
use crate::gateway::{CallOptions, RetryPolicy, SharedGateway};
use crate::pipeline::stages::open_coding::{run_coding_pass, PassOutcome};
use crate::types::{Document, DocumentId, ProjectState, QualError, Result};

use super::agreement::{fleiss_kappa, pair_agreement, CodingPass, Kappa, PairAgreement};

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    InterRater,
    Stability,
}

/// Full reliability report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub kind: ReportKind,
    /// Pass labels in run order.
    pub passes: Vec<String>,
    pub documents: usize,
    /// Cohen's kappa for every unordered pass pair.
    pub pairwise: Vec<PairAgreement>,
    /// Fleiss' kappa across all passes (equals the single pairwise kappa
    /// when only two passes ran).
    pub overall: Kappa,
    pub band: String,
    pub generated_at: DateTime<Utc>,
}

// =============================================================================
// Prompt Perturbations
// =============================================================================

/// Alternative framings prepended to the coding prompt so that repeated
/// passes are not verbatim re-submissions. Order matters: pass i uses
/// framing i modulo the table length.
const PERTURBATIONS: &[&str] = &[
    "You are an experienced qualitative researcher coding interview data.",
    "You are a methodical grounded-theory analyst; code conservatively and \
     only where the text clearly supports it.",
    "You are a second coder reviewing transcripts independently; rely only on \
     what participants actually said.",
    "You are a sociologist coding field transcripts; prefer conceptual labels \
     over topical ones.",
];

// =============================================================================
// Engine
// =============================================================================

pub struct ReliabilityEngine {
    retry: RetryPolicy,
    concurrency: usize,
}

impl Default for ReliabilityEngine {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: crate::constants::concurrency::MAX_DOCUMENT_CONCURRENCY,
        }
    }
}

impl ReliabilityEngine {
    pub fn new(retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Inter-rater reliability with one model: `passes` independent coding
    /// passes, each under a different prompt framing.
    #[instrument(skip_all, fields(project = %state.id, passes))]
    pub async fn run_irr(
        &self,
        state: &ProjectState,
        gateway: SharedGateway,
        passes: usize,
    ) -> Result<ReliabilityReport> {
        if passes < 2 {
            return Err(QualError::Stats(format!(
                "inter-rater reliability needs at least 2 passes, got {}",
                passes
            )));
        }
        let documents = Self::document_set(state)?;

        let mut coded = Vec::with_capacity(passes);
        for i in 0..passes {
            let label = format!("pass-{}", i + 1);
            let framing = PERTURBATIONS[i % PERTURBATIONS.len()];
            let outcome = run_coding_pass(
                gateway.as_ref(),
                &documents,
                &state.codebook,
                Some(framing),
                CallOptions::default(),
                &self.retry,
                self.concurrency,
            )
            .await?;
            coded.push(self.to_pass(state, label, outcome)?);
        }

        self.build_report(ReportKind::InterRater, coded, &documents)
    }

    /// Inter-rater reliability across models: one pass per gateway, labeled
    /// by model name.
    #[instrument(skip_all, fields(project = %state.id, models = gateways.len()))]
    pub async fn run_irr_models(
        &self,
        state: &ProjectState,
        gateways: &[SharedGateway],
    ) -> Result<ReliabilityReport> {
        if gateways.len() < 2 {
            return Err(QualError::Stats(format!(
                "cross-model reliability needs at least 2 gateways, got {}",
                gateways.len()
            )));
        }
        let documents = Self::document_set(state)?;

        let mut coded = Vec::with_capacity(gateways.len());
        for gateway in gateways {
            let outcome = run_coding_pass(
                gateway.as_ref(),
                &documents,
                &state.codebook,
                None,
                CallOptions::default(),
                &self.retry,
                self.concurrency,
            )
            .await?;
            coded.push(self.to_pass(state, gateway.model().to_string(), outcome)?);
        }

        self.build_report(ReportKind::InterRater, coded, &documents)
    }

    /// Stability: fixed prompt and model, varied sampling parameters. Each
    /// pass gets a fresh random seed and a stepped temperature.
    #[instrument(skip_all, fields(project = %state.id, passes))]
    pub async fn run_stability(
        &self,
        state: &ProjectState,
        gateway: SharedGateway,
        passes: usize,
    ) -> Result<ReliabilityReport> {
        if passes < 2 {
            return Err(QualError::Stats(format!(
                "stability analysis needs at least 2 passes, got {}",
                passes
            )));
        }
        let documents = Self::document_set(state)?;
        let mut rng = rand::rng();

        let mut coded = Vec::with_capacity(passes);
        for i in 0..passes {
            let options = CallOptions {
                temperature: Some(STABILITY_TEMPERATURE_STEP * i as f32),
                seed: Some(rng.random()),
            };
            let outcome = run_coding_pass(
                gateway.as_ref(),
                &documents,
                &state.codebook,
                None,
                options,
                &self.retry,
                self.concurrency,
            )
            .await?;
            coded.push(self.to_pass(state, format!("run-{}", i + 1), outcome)?);
        }

        self.build_report(ReportKind::Stability, coded, &documents)
    }

    /// All ingested documents; reliability passes re-code everything.
    fn document_set(state: &ProjectState) -> Result<Vec<&Document>> {
        if state.documents.is_empty() {
            return Err(QualError::Stats(
                "project has no documents to code".into(),
            ));
        }
        Ok(state.documents.iter().collect())
    }

    fn to_pass(
        &self,
        state: &ProjectState,
        label: impl Into<String>,
        outcome: PassOutcome,
    ) -> Result<CodingPass> {
        // Labels resolve through the pass's own codebook (base + discoveries).
        let book = outcome.codebook(&state.codebook)?;
        Ok(CodingPass::from_applications(
            label,
            &book,
            &outcome.applications,
        ))
    }

    fn build_report(
        &self,
        kind: ReportKind,
        passes: Vec<CodingPass>,
        documents: &[&Document],
    ) -> Result<ReliabilityReport> {
        let doc_ids: Vec<DocumentId> = documents.iter().map(|d| d.id).collect();

        let mut pairwise = Vec::new();
        for i in 0..passes.len() {
            for j in (i + 1)..passes.len() {
                pairwise.push(pair_agreement(&passes[i], &passes[j], &doc_ids));
            }
        }

        let overall = if passes.len() == 2 {
            pairwise[0].kappa.clone()
        } else {
            fleiss_kappa(&passes, &doc_ids)
        };
        let band = overall.band().to_string();
        info!(?kind, passes = passes.len(), band = %band, "reliability report built");

        Ok(ReliabilityReport {
            kind,
            passes: passes.into_iter().map(|p| p.label).collect(),
            documents: doc_ids.len(),
            pairwise,
            overall,
            band,
            generated_at: Utc::now(),
        })
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
    use serde_json::json;
    use std::sync::Arc;

    fn project(n_docs: usize) -> ProjectState {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        for i in 0..n_docs {
            state.add_document(Document::new(
                format!("i{i}"),
                format!("doc {i}: trust is gone"),
                vec![],
            ));
        }
        state
    }

    /// Gateway that always codes "trust issues" over the same quote,
    /// regardless of framing: a perfectly consistent rater.
    fn consistent_gateway() -> SharedGateway {
        Arc::new(ScriptedGateway::with_handler(|_, _| {
            Ok(json!({
                "codes": [{
                    "name": "trust issues",
                    "definition": "loss of trust",
                    "applications": [{"quote": "trust is gone"}]
                }]
            }))
        }))
    }

    #[tokio::test]
    async fn test_irr_consistent_rater_perfect_kappa() {
        let state = project(3);
        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 2);
        let report = engine
            .run_irr(&state, consistent_gateway(), 2)
            .await
            .unwrap();

        assert_eq!(report.kind, ReportKind::InterRater);
        assert_eq!(report.passes, vec!["pass-1", "pass-2"]);
        assert_eq!(report.pairwise.len(), 1);
        assert_eq!(report.overall.value(), Some(1.0));
        assert_eq!(report.band, "almost perfect");
    }

    #[tokio::test]
    async fn test_irr_three_passes_pairwise_count() {
        let state = project(2);
        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 2);
        let report = engine
            .run_irr(&state, consistent_gateway(), 3)
            .await
            .unwrap();
        // 3 passes -> 3 unordered pairs, overall from Fleiss.
        assert_eq!(report.pairwise.len(), 3);
        assert_eq!(report.overall.value(), Some(1.0));
    }

    #[tokio::test]
    async fn test_irr_rejects_single_pass() {
        let state = project(1);
        let engine = ReliabilityEngine::default();
        let err = engine
            .run_irr(&state, consistent_gateway(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QualError::Stats(_)));
    }

    #[tokio::test]
    async fn test_irr_rejects_empty_project() {
        let state = project(0);
        let engine = ReliabilityEngine::default();
        let err = engine
            .run_irr(&state, consistent_gateway(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, QualError::Stats(_)));
    }

    #[tokio::test]
    async fn test_irr_perturbations_reach_prompts() {
        let state = project(1);
        // Record the distinct framings the gateway sees.
        let seen = Arc::new(std::sync::Mutex::new(std::collections::BTreeSet::new()));
        let seen_clone = Arc::clone(&seen);
        let gateway = Arc::new(ScriptedGateway::with_handler(move |prompt, _| {
            let first_line = prompt.lines().next().unwrap_or("").to_string();
            seen_clone.lock().unwrap().insert(first_line);
            Ok(json!({"codes": []}))
        }));
        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 1);
        engine.run_irr(&state, gateway, 3).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3, "each pass framed differently");
    }

    #[tokio::test]
    async fn test_divergent_raters_score_below_perfect() {
        let state = project(3);
        // A rater that codes doc 0 only on even-numbered calls, so the two
        // passes disagree on that unit.
        let flip = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let flip_clone = Arc::clone(&flip);
        let gateway = Arc::new(ScriptedGateway::with_handler(move |prompt, _| {
            let n = flip_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n % 2 == 0 && prompt.contains("doc 0") {
                Ok(json!({
                    "codes": [{
                        "name": "trust issues",
                        "definition": "d",
                        "applications": [{"quote": "trust is gone"}]
                    }]
                }))
            } else {
                Ok(json!({"codes": []}))
            }
        }));
        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 1);
        let report = engine.run_irr(&state, gateway, 2).await.unwrap();
        if let Some(kappa) = report.overall.value() {
            assert!(kappa < 1.0);
        }
    }

    #[tokio::test]
    async fn test_stability_varies_call_options() {
        let state = project(1);
        let options_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let gateway = {
            let seen = Arc::clone(&options_seen);
            // call_with is exercised through a gateway that records options
            struct Recording {
                seen: Arc<std::sync::Mutex<Vec<CallOptions>>>,
            }
            #[async_trait::async_trait]
            impl crate::gateway::LlmGateway for Recording {
                async fn call(
                    &self,
                    _prompt: &str,
                    _schema: &crate::gateway::SchemaDescriptor,
                ) -> crate::gateway::GatewayResult<serde_json::Value> {
                    Ok(json!({"codes": []}))
                }
                async fn call_with(
                    &self,
                    prompt: &str,
                    schema: &crate::gateway::SchemaDescriptor,
                    options: &CallOptions,
                ) -> crate::gateway::GatewayResult<serde_json::Value> {
                    self.seen.lock().unwrap().push(*options);
                    self.call(prompt, schema).await
                }
                fn name(&self) -> &str {
                    "recording"
                }
                fn model(&self) -> &str {
                    "recording"
                }
            }
            Arc::new(Recording { seen })
        };

        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 1);
        let report = engine.run_stability(&state, gateway, 3).await.unwrap();
        assert_eq!(report.kind, ReportKind::Stability);

        let seen = options_seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let temps: Vec<_> = seen.iter().map(|o| o.temperature).collect();
        assert_eq!(temps[0], Some(0.0));
        assert!(temps[1] > temps[0] && temps[2] > temps[1]);
        assert!(seen.iter().all(|o| o.seed.is_some()));
    }

    #[tokio::test]
    async fn test_cross_model_irr_labels_by_model() {
        let state = project(1);
        let engine = ReliabilityEngine::new(RetryPolicy::new(0), 1);
        let report = engine
            .run_irr_models(&state, &[consistent_gateway(), consistent_gateway()])
            .await
            .unwrap();
        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.passes[0], "scripted");
    }
}
