//! Theoretical Sampling
//!
//! Advises which uncoded documents to analyze next by ranking them against
//! the under-developed parts of the codebook: codes with few applications
//! need more data, so documents whose vocabulary resembles those codes'
//! quotes and definitions score higher. Purely advisory and read-only; it
//! never mutates project state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::constants::sampling::UNDERDEVELOPED_MAX_APPLICATIONS;
use crate::types::{Code, DocumentId, ProjectState, Result};

// =============================================================================
// Recommendation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRecommendation {
    pub document_id: DocumentId,
    pub title: String,
    /// Relevance score; higher means more likely to develop weak codes.
    pub score: f64,
    /// Which under-developed codes the document appears to speak to.
    pub rationale: String,
}

/// An active code with fewer applications than the development threshold.
#[derive(Debug, Clone)]
struct UnderdevelopedCode {
    name: String,
    application_count: usize,
    vocabulary: BTreeSet<String>,
}

// =============================================================================
// Advisor
// =============================================================================

#[derive(Debug, Default)]
pub struct TheoreticalSamplingAdvisor;

impl TheoreticalSamplingAdvisor {
    /// Rank uncoded documents by how much they could develop weak codes.
    ///
    /// Returns an empty list once the project is saturated: theoretical
    /// sampling exists to chase unsaturated categories, and a saturated
    /// codebook has none left to chase.
    #[instrument(skip_all, fields(project = %state.id))]
    pub fn recommend(&self, state: &ProjectState) -> Result<Vec<SamplingRecommendation>> {
        if state.saturated {
            info!("project saturated; no further sampling recommended");
            return Ok(Vec::new());
        }

        let weak = self.underdeveloped_codes(state);
        if weak.is_empty() {
            debug!("no under-developed codes");
            return Ok(Vec::new());
        }

        let mut recommendations: Vec<SamplingRecommendation> = state
            .uncoded_documents()
            .map(|doc| {
                let doc_tokens = tokenize(&doc.text);
                let mut score = 0.0;
                let mut matched: Vec<&str> = Vec::new();
                for code in &weak {
                    let overlap = code
                        .vocabulary
                        .intersection(&doc_tokens)
                        .count() as f64;
                    if overlap == 0.0 || code.vocabulary.is_empty() {
                        continue;
                    }
                    // Codes with fewer applications weigh more.
                    let weight = 1.0 / (1.0 + code.application_count as f64);
                    score += weight * overlap / code.vocabulary.len() as f64;
                    matched.push(&code.name);
                }
                let rationale = if matched.is_empty() {
                    "no overlap with under-developed codes".to_string()
                } else {
                    format!("may develop: {}", matched.join(", "))
                };
                SamplingRecommendation {
                    document_id: doc.id,
                    title: doc.title.clone(),
                    score,
                    rationale,
                }
            })
            .collect();

        recommendations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(recommendations)
    }

    fn underdeveloped_codes(&self, state: &ProjectState) -> Vec<UnderdevelopedCode> {
        state
            .codebook
            .active_codes()
            .filter_map(|code| {
                let apps = state.applications_for_code(&code.id);
                if apps.len() > UNDERDEVELOPED_MAX_APPLICATIONS {
                    return None;
                }
                let mut vocabulary = code_vocabulary(code);
                for app in &apps {
                    vocabulary.extend(tokenize(&app.quote));
                }
                Some(UnderdevelopedCode {
                    name: code.name.clone(),
                    application_count: apps.len(),
                    vocabulary,
                })
            })
            .collect()
    }
}

fn code_vocabulary(code: &Code) -> BTreeSet<String> {
    let mut vocab = tokenize(&code.name);
    vocab.extend(tokenize(&code.definition));
    vocab
}

/// Lowercased alphanumeric tokens of length >= 4; short function words
/// carry no sampling signal.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_lowercase)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::methodology::Methodology;
    use crate::types::{CodeApplication, Document, Span, StateDelta};

    fn project_with_weak_code() -> ProjectState {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        let mut coded = Document::new("coded", "participants described losing trust", vec![]);
        coded.coded = true;
        let coded_id = coded.id;
        state.add_document(coded);

        let code = Code::discovered(
            "trust erosion",
            "gradual loss of trust in institutions",
            0.8,
            "r",
        );
        let code_id = code.id;
        state
            .apply_delta(&StateDelta {
                new_codes: vec![code],
                new_applications: vec![CodeApplication::new(
                    code_id,
                    coded_id,
                    Span::new(23, 36),
                    "losing trust",
                    0,
                )],
                ..Default::default()
            })
            .unwrap();
        state
    }

    #[test]
    fn test_ranks_relevant_document_first() {
        let mut state = project_with_weak_code();
        state.add_document(Document::new(
            "relevant",
            "another story about trust collapsing in institutions",
            vec![],
        ));
        state.add_document(Document::new(
            "irrelevant",
            "weather patterns over the northern coastline",
            vec![],
        ));

        let recs = TheoreticalSamplingAdvisor.recommend(&state).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].title, "relevant");
        assert!(recs[0].score > recs[1].score);
        assert!(recs[0].rationale.contains("trust erosion"));
    }

    #[test]
    fn test_saturated_project_gets_no_recommendations() {
        let mut state = project_with_weak_code();
        state.add_document(Document::new("more", "trust talk", vec![]));
        state.saturated = true;
        assert!(TheoreticalSamplingAdvisor
            .recommend(&state)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_well_developed_codes_not_chased() {
        let mut state = project_with_weak_code();
        // Push the code over the development threshold.
        let code_id = state.codebook.find_by_name("trust erosion").unwrap().id;
        let doc_id = state.documents[0].id;
        let apps = (0..4)
            .map(|i| CodeApplication::new(code_id, doc_id, Span::new(i, i + 2), "q", 1))
            .collect();
        state
            .apply_delta(&StateDelta {
                new_applications: apps,
                ..Default::default()
            })
            .unwrap();
        state.add_document(Document::new("next", "more trust material", vec![]));

        let recs = TheoreticalSamplingAdvisor.recommend(&state).unwrap();
        assert!(recs.is_empty(), "no under-developed codes to sample for");
    }

    #[test]
    fn test_no_uncoded_documents() {
        let state = project_with_weak_code();
        let recs = TheoreticalSamplingAdvisor.recommend(&state).unwrap();
        assert!(recs.is_empty());
    }
}
