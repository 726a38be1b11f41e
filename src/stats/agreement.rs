//! Agreement Statistics
//!
//! Pairwise and multi-rater chance-corrected agreement over coding passes.
//!
//! The unit of analysis is (document × candidate code label): every document
//! in the compared set crossed with every normalized code name any pass
//! produced. Two passes agree on a unit when both applied the label to the
//! document with at least one overlapping span, or when neither applied it.
//!
//! Degenerate inputs (no units, chance agreement of 1) report an explicit
//! `Undefined` kappa rather than a fabricated number.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{normalize_code_name, Codebook, CodeApplication, DocumentId, Span};

// =============================================================================
// Coding Pass
// =============================================================================

/// One coder's (one pass's) view of the document set: which labels were
/// applied where.
#[derive(Debug, Clone)]
pub struct CodingPass {
    /// Pass label for reporting ("pass-1", a model name, ...).
    pub label: String,
    /// (document, normalized code name) → spans where it was applied.
    applications: BTreeMap<(DocumentId, String), Vec<Span>>,
}

impl CodingPass {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            applications: BTreeMap::new(),
        }
    }

    /// Build from a pass's codebook and applications. Application labels are
    /// resolved through the codebook so merged/renamed codes report their
    /// final names.
    pub fn from_applications(
        label: impl Into<String>,
        codebook: &Codebook,
        applications: &[CodeApplication],
    ) -> Self {
        let mut pass = Self::new(label);
        for app in applications {
            if let Some(code) = codebook.get(&app.code_id) {
                pass.record(app.document_id, &code.name, app.span);
            }
        }
        pass
    }

    pub fn record(&mut self, document: DocumentId, code_name: &str, span: Span) {
        self.applications
            .entry((document, normalize_code_name(code_name)))
            .or_default()
            .push(span);
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.applications.keys().map(|(_, label)| label.as_str())
    }

    fn spans(&self, document: &DocumentId, label: &str) -> Option<&[Span]> {
        self.applications
            .get(&(*document, label.to_string()))
            .map(Vec::as_slice)
    }

    fn applied(&self, document: &DocumentId, label: &str) -> bool {
        self.spans(document, label).is_some()
    }
}

// =============================================================================
// Kappa Value
// =============================================================================

/// A kappa statistic, or an explicit statement of why it cannot be computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Kappa {
    Defined { value: f64 },
    Undefined { reason: String },
}

impl Kappa {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Defined { value } => Some(*value),
            Self::Undefined { .. } => None,
        }
    }

    /// Landis & Koch interpretation band.
    pub fn band(&self) -> &'static str {
        match self {
            Self::Undefined { .. } => "undefined",
            Self::Defined { value } => interpretation_band(*value),
        }
    }
}

/// Landis & Koch (1977) qualitative bands.
pub fn interpretation_band(kappa: f64) -> &'static str {
    if kappa < 0.0 {
        "poor"
    } else if kappa <= 0.20 {
        "slight"
    } else if kappa <= 0.40 {
        "fair"
    } else if kappa <= 0.60 {
        "moderate"
    } else if kappa <= 0.80 {
        "substantial"
    } else {
        "almost perfect"
    }
}

// =============================================================================
// Pairwise Agreement
// =============================================================================

/// Agreement between one ordered pair of passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAgreement {
    pub pass_a: String,
    pub pass_b: String,
    pub total_units: usize,
    pub agreeing_units: usize,
    pub percent_agreement: f64,
    pub kappa: Kappa,
    pub band: String,
}

/// Candidate labels across all passes.
fn candidate_labels(passes: &[&CodingPass]) -> BTreeSet<String> {
    passes
        .iter()
        .flat_map(|p| p.labels().map(str::to_string))
        .collect()
}

/// Whether two span lists share any overlapping pair.
fn spans_overlap(a: &[Span], b: &[Span]) -> bool {
    a.iter().any(|sa| b.iter().any(|sb| sa.overlaps(sb)))
}

/// Percent agreement and Cohen's kappa for two passes over a document set.
pub fn pair_agreement(
    pass_a: &CodingPass,
    pass_b: &CodingPass,
    documents: &[DocumentId],
) -> PairAgreement {
    let labels = candidate_labels(&[pass_a, pass_b]);
    let total_units = documents.len() * labels.len();

    let mut agreeing = 0usize;
    let mut applied_a = 0usize;
    let mut applied_b = 0usize;

    for doc in documents {
        for label in &labels {
            let a = pass_a.spans(doc, label);
            let b = pass_b.spans(doc, label);
            if a.is_some() {
                applied_a += 1;
            }
            if b.is_some() {
                applied_b += 1;
            }
            match (a, b) {
                (Some(sa), Some(sb)) if spans_overlap(sa, sb) => agreeing += 1,
                (None, None) => agreeing += 1,
                _ => {}
            }
        }
    }

    let (percent, kappa) = if total_units == 0 {
        (
            0.0,
            Kappa::Undefined {
                reason: "no comparable units between passes".into(),
            },
        )
    } else {
        let n = total_units as f64;
        let po = agreeing as f64 / n;
        let pa = applied_a as f64 / n;
        let pb = applied_b as f64 / n;
        let pe = pa * pb + (1.0 - pa) * (1.0 - pb);
        let kappa = if (1.0 - pe).abs() < f64::EPSILON {
            Kappa::Undefined {
                reason: "chance agreement is 1; kappa undefined".into(),
            }
        } else {
            Kappa::Defined {
                value: (po - pe) / (1.0 - pe),
            }
        };
        (po, kappa)
    };

    let band = kappa.band().to_string();
    PairAgreement {
        pass_a: pass_a.label.clone(),
        pass_b: pass_b.label.clone(),
        total_units,
        agreeing_units: agreeing,
        percent_agreement: percent,
        kappa,
        band,
    }
}

// =============================================================================
// Fleiss' Kappa
// =============================================================================

/// Fleiss' kappa over all passes simultaneously.
///
/// Categories are binary (applied / not applied) per unit. Span overlap is a
/// pairwise notion and does not extend cleanly to n raters, so the
/// multi-rater statistic uses name-normalized application only.
pub fn fleiss_kappa(passes: &[CodingPass], documents: &[DocumentId]) -> Kappa {
    let n_raters = passes.len();
    if n_raters < 2 {
        return Kappa::Undefined {
            reason: "fleiss kappa requires at least 2 raters".into(),
        };
    }
    let refs: Vec<&CodingPass> = passes.iter().collect();
    let labels = candidate_labels(&refs);
    let n_units = documents.len() * labels.len();
    if n_units == 0 {
        return Kappa::Undefined {
            reason: "no comparable units between passes".into(),
        };
    }

    let n = n_raters as f64;
    let mut sum_p_i = 0.0;
    let mut applied_total = 0usize;

    for doc in documents {
        for label in &labels {
            let applied = passes.iter().filter(|p| p.applied(doc, label)).count();
            applied_total += applied;
            let a = applied as f64;
            let b = (n_raters - applied) as f64;
            // Agreement for this unit: fraction of rater pairs in the same category.
            sum_p_i += (a * (a - 1.0) + b * (b - 1.0)) / (n * (n - 1.0));
        }
    }

    let p_bar = sum_p_i / n_units as f64;
    let p_applied = applied_total as f64 / (n_units as f64 * n);
    let p_e = p_applied * p_applied + (1.0 - p_applied) * (1.0 - p_applied);

    if (1.0 - p_e).abs() < f64::EPSILON {
        return Kappa::Undefined {
            reason: "chance agreement is 1; kappa undefined".into(),
        };
    }
    Kappa::Defined {
        value: (p_bar - p_e) / (1.0 - p_e),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc_ids(n: usize) -> Vec<DocumentId> {
        (0..n).map(|_| DocumentId::new()).collect()
    }

    fn span() -> Span {
        Span::new(0, 10)
    }

    #[test]
    fn test_regression_trust_issues() {
        // Pass A applies "trust_issues" to docs {1,2}, pass B to {1,3}.
        // 3 units, 1 agreement: percent = 1/3, kappa = -0.5.
        let docs = doc_ids(3);
        let mut a = CodingPass::new("A");
        a.record(docs[0], "trust_issues", span());
        a.record(docs[1], "trust_issues", span());
        let mut b = CodingPass::new("B");
        b.record(docs[0], "trust_issues", span());
        b.record(docs[2], "trust_issues", span());

        let result = pair_agreement(&a, &b, &docs);
        assert_eq!(result.total_units, 3);
        assert_eq!(result.agreeing_units, 1);
        assert!((result.percent_agreement - 1.0 / 3.0).abs() < 1e-9);
        let kappa = result.kappa.value().unwrap();
        assert!((kappa - (-0.5)).abs() < 1e-9, "kappa = {kappa}");
        assert_eq!(result.band, "poor");
    }

    #[test]
    fn test_identical_passes_perfect_agreement() {
        let docs = doc_ids(3);
        let mut a = CodingPass::new("A");
        let mut b = CodingPass::new("B");
        for pass in [&mut a, &mut b] {
            pass.record(docs[0], "alpha", span());
            pass.record(docs[1], "beta", span());
        }
        let result = pair_agreement(&a, &b, &docs);
        assert!((result.percent_agreement - 1.0).abs() < 1e-9);
        assert_eq!(result.kappa.value(), Some(1.0));
        assert_eq!(result.band, "almost perfect");
    }

    #[test]
    fn test_overlap_required_for_agreement() {
        // Both passes apply the label to the same doc but in disjoint spans.
        let docs = doc_ids(2);
        let mut a = CodingPass::new("A");
        a.record(docs[0], "alpha", Span::new(0, 10));
        let mut b = CodingPass::new("B");
        b.record(docs[0], "alpha", Span::new(50, 60));

        let result = pair_agreement(&a, &b, &docs);
        // unit (doc0, alpha) disagrees despite both applying; (doc1, alpha) agrees
        assert_eq!(result.total_units, 2);
        assert_eq!(result.agreeing_units, 1);
    }

    #[test]
    fn test_zero_units_undefined() {
        let a = CodingPass::new("A");
        let b = CodingPass::new("B");
        let result = pair_agreement(&a, &b, &[]);
        assert!(matches!(result.kappa, Kappa::Undefined { .. }));
        assert_eq!(result.band, "undefined");
    }

    #[test]
    fn test_all_applied_undefined_pe_one() {
        // Both passes apply the label to every doc: Pe = 1.
        let docs = doc_ids(2);
        let mut a = CodingPass::new("A");
        let mut b = CodingPass::new("B");
        for doc in &docs {
            a.record(*doc, "alpha", span());
            b.record(*doc, "alpha", span());
        }
        let result = pair_agreement(&a, &b, &docs);
        assert!((result.percent_agreement - 1.0).abs() < 1e-9);
        assert!(matches!(result.kappa, Kappa::Undefined { .. }));
    }

    #[test]
    fn test_interpretation_bands() {
        assert_eq!(interpretation_band(-0.2), "poor");
        assert_eq!(interpretation_band(0.1), "slight");
        assert_eq!(interpretation_band(0.3), "fair");
        assert_eq!(interpretation_band(0.5), "moderate");
        assert_eq!(interpretation_band(0.7), "substantial");
        assert_eq!(interpretation_band(0.95), "almost perfect");
        assert_eq!(interpretation_band(0.20), "slight");
        assert_eq!(interpretation_band(0.80), "substantial");
    }

    #[test]
    fn test_fleiss_identical_three_raters() {
        let docs = doc_ids(3);
        let mut passes = Vec::new();
        for i in 0..3 {
            let mut p = CodingPass::new(format!("pass-{i}"));
            p.record(docs[0], "alpha", span());
            p.record(docs[1], "beta", span());
            passes.push(p);
        }
        let kappa = fleiss_kappa(&passes, &docs);
        assert_eq!(kappa.value(), Some(1.0));
    }

    #[test]
    fn test_fleiss_requires_two_raters() {
        let docs = doc_ids(2);
        let passes = vec![CodingPass::new("solo")];
        assert!(matches!(
            fleiss_kappa(&passes, &docs),
            Kappa::Undefined { .. }
        ));
    }

    #[test]
    fn test_fleiss_partial_disagreement_in_bounds() {
        let docs = doc_ids(4);
        let mut p1 = CodingPass::new("1");
        let mut p2 = CodingPass::new("2");
        let mut p3 = CodingPass::new("3");
        p1.record(docs[0], "alpha", span());
        p1.record(docs[1], "alpha", span());
        p2.record(docs[0], "alpha", span());
        p3.record(docs[2], "alpha", span());
        let kappa = fleiss_kappa(&[p1, p2, p3], &docs).value().unwrap();
        assert!((-1.0..=1.0).contains(&kappa));
    }

    proptest! {
        #[test]
        fn prop_cohen_kappa_in_bounds(
            a_mask in proptest::collection::vec(any::<bool>(), 1..12),
            b_mask in proptest::collection::vec(any::<bool>(), 1..12),
        ) {
            let n = a_mask.len().min(b_mask.len());
            let docs = doc_ids(n);
            let mut a = CodingPass::new("A");
            let mut b = CodingPass::new("B");
            for i in 0..n {
                if a_mask[i] {
                    a.record(docs[i], "label", span());
                }
                if b_mask[i] {
                    b.record(docs[i], "label", span());
                }
            }
            let result = pair_agreement(&a, &b, &docs);
            if let Some(kappa) = result.kappa.value() {
                prop_assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&kappa));
            }
            prop_assert!((0.0..=1.0).contains(&result.percent_agreement));
        }
    }
}
