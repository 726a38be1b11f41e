//! Codebook Model
//!
//! The versioned hierarchical set of codes for a project. Codes form a
//! forest (themes are roots, categories and codes nest below); cycles are
//! forbidden. The codebook is a value: nothing mutates a version in place;
//! every change is made on a successor produced by [`Codebook::successor`],
//! and prior versions are retained by the storage layer for audit.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::error::{QualError, Result};
use super::{normalize_code_name, ApplicationId, CodeId, DocumentId};

// =============================================================================
// Span
// =============================================================================

/// Half-open character span `[start, end)` within a document's raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether two spans share at least one character position.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// Code
// =============================================================================

/// Who produced (or confirmed) a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Discovered by a coding stage.
    Llm,
    /// Created directly by a human (e.g. via a split decision).
    Human,
    /// LLM-discovered, then approved during review.
    HumanConfirmed,
}

/// A single code in the codebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub id: CodeId,
    pub name: String,
    pub definition: String,
    /// Parent code id; `None` for roots (themes). The parent graph must be a
    /// forest; cycle creation is rejected at insertion time.
    pub parent: Option<CodeId>,
    pub provenance: Provenance,
    /// Model-reported confidence in [0, 1]; 1.0 for human-authored codes.
    pub confidence: f64,
    /// Model's stated reasoning for proposing this code.
    pub reasoning: String,
    /// Set by a merge decision; a superseded code is out of the active set
    /// but never hard-deleted.
    pub superseded_by: Option<CodeId>,
}

impl Code {
    /// New LLM-discovered code with no parent.
    pub fn discovered(
        name: impl Into<String>,
        definition: impl Into<String>,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: CodeId::new(),
            name: name.into(),
            definition: definition.into(),
            parent: None,
            provenance: Provenance::Llm,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            superseded_by: None,
        }
    }

    /// New human-authored code (review decisions).
    pub fn human(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            id: CodeId::new(),
            name: name.into(),
            definition: definition.into(),
            parent: None,
            provenance: Provenance::Human,
            confidence: 1.0,
            reasoning: String::new(),
            superseded_by: None,
        }
    }

    pub fn with_parent(mut self, parent: CodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn normalized_name(&self) -> String {
        normalize_code_name(&self.name)
    }

    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

// =============================================================================
// Code Application
// =============================================================================

/// A link between a code and a quoted span in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeApplication {
    pub id: ApplicationId,
    pub code_id: CodeId,
    pub document_id: DocumentId,
    pub span: Span,
    pub quote: String,
    /// Codebook version that was active when this application was created.
    pub codebook_version: u64,
}

impl CodeApplication {
    pub fn new(
        code_id: CodeId,
        document_id: DocumentId,
        span: Span,
        quote: impl Into<String>,
        codebook_version: u64,
    ) -> Self {
        Self {
            id: ApplicationId::new(),
            code_id,
            document_id,
            span,
            quote: quote.into(),
            codebook_version,
        }
    }

    /// Dedup key used by merge: same document and identical span.
    pub fn span_key(&self) -> (DocumentId, Span) {
        (self.document_id, self.span)
    }
}

// =============================================================================
// Codebook
// =============================================================================

/// The versioned code forest. `version` is monotonically increasing; the
/// active set excludes superseded codes but superseded entries remain in the
/// map for the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    pub version: u64,
    /// BTreeMap for deterministic iteration order across runs.
    codes: BTreeMap<CodeId, Code>,
}

impl Codebook {
    pub fn new() -> Self {
        Self {
            version: 0,
            codes: BTreeMap::new(),
        }
    }

    /// Clone into the next version. All review/coding mutations operate on
    /// the successor, never on `self`.
    pub fn successor(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    pub fn get(&self, id: &CodeId) -> Option<&Code> {
        self.codes.get(id)
    }

    /// Fetch a code, raising on unknown ids (fail-loud policy).
    pub fn require(&self, id: &CodeId) -> Result<&Code> {
        self.codes
            .get(id)
            .ok_or_else(|| QualError::UnknownCode(id.to_string()))
    }

    pub fn contains(&self, id: &CodeId) -> bool {
        self.codes.contains_key(id)
    }

    /// Active (non-superseded) codes.
    pub fn active_codes(&self) -> impl Iterator<Item = &Code> {
        self.codes.values().filter(|c| c.is_active())
    }

    /// All codes including superseded ones.
    pub fn all_codes(&self) -> impl Iterator<Item = &Code> {
        self.codes.values()
    }

    pub fn active_count(&self) -> usize {
        self.active_codes().count()
    }

    /// Root codes of the active forest (themes).
    pub fn roots(&self) -> impl Iterator<Item = &Code> {
        self.active_codes().filter(|c| c.parent.is_none())
    }

    /// Direct active children of a code.
    pub fn children(&self, id: &CodeId) -> Vec<&Code> {
        self.active_codes()
            .filter(|c| c.parent.as_ref() == Some(id))
            .collect()
    }

    /// Find an active code by normalized name.
    pub fn find_by_name(&self, name: &str) -> Option<&Code> {
        let needle = normalize_code_name(name);
        self.active_codes().find(|c| c.normalized_name() == needle)
    }

    /// Normalized names of the active set; the unit of saturation comparison.
    pub fn active_name_set(&self) -> BTreeSet<String> {
        self.active_codes().map(|c| c.normalized_name()).collect()
    }

    /// Insert a new code, validating the parent pointer.
    ///
    /// The parent must exist and the insertion must not create a cycle. A
    /// fresh id cannot point at itself through existing codes, but a caller
    /// re-inserting with a fixed id could, so the walk is always performed.
    pub fn insert(&mut self, code: Code) -> Result<()> {
        if let Some(parent) = &code.parent {
            self.require(parent)?;
            self.check_no_cycle(&code.id, parent)?;
        }
        if self.codes.contains_key(&code.id) {
            return Err(QualError::Invariant(format!(
                "code {} already exists in version {}",
                code.id, self.version
            )));
        }
        self.codes.insert(code.id, code);
        Ok(())
    }

    /// Re-parent an existing code, validating against cycles.
    pub fn set_parent(&mut self, id: &CodeId, parent: Option<CodeId>) -> Result<()> {
        self.require(id)?;
        if let Some(p) = &parent {
            self.require(p)?;
            self.check_no_cycle(id, p)?;
        }
        if let Some(code) = self.codes.get_mut(id) {
            code.parent = parent;
        }
        Ok(())
    }

    /// Mutable access for review operations; the ReviewManager is the only
    /// intended caller and always works on a successor version.
    pub(crate) fn get_mut(&mut self, id: &CodeId) -> Result<&mut Code> {
        self.codes
            .get_mut(id)
            .ok_or_else(|| QualError::UnknownCode(id.to_string()))
    }

    /// Remove a code outright (reject decision). Superseded codes from merge
    /// stay in the map; this is only for rejection, where prior versions in
    /// storage preserve the audit trail.
    pub(crate) fn remove(&mut self, id: &CodeId) -> Result<Code> {
        self.codes
            .remove(id)
            .ok_or_else(|| QualError::UnknownCode(id.to_string()))
    }

    fn check_no_cycle(&self, child: &CodeId, parent: &CodeId) -> Result<()> {
        let mut cursor = Some(*parent);
        let mut hops = 0usize;
        while let Some(current) = cursor {
            if &current == child {
                return Err(QualError::Invariant(format!(
                    "cyclic parent pointer: {} is an ancestor of itself",
                    child
                )));
            }
            hops += 1;
            if hops > self.codes.len() + 1 {
                return Err(QualError::Invariant(
                    "parent chain longer than codebook; corrupt forest".into(),
                ));
            }
            cursor = self.codes.get(&current).and_then(|c| c.parent);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(names: &[&str]) -> (Codebook, Vec<CodeId>) {
        let mut book = Codebook::new();
        let mut ids = Vec::new();
        for name in names {
            let code = Code::discovered(*name, format!("def of {name}"), 0.9, "r");
            ids.push(code.id);
            book.insert(code).unwrap();
        }
        (book, ids)
    }

    #[test]
    fn test_span_overlap() {
        assert!(Span::new(0, 10).overlaps(&Span::new(5, 15)));
        assert!(Span::new(5, 15).overlaps(&Span::new(0, 10)));
        assert!(!Span::new(0, 10).overlaps(&Span::new(10, 20)));
        assert!(!Span::new(10, 20).overlaps(&Span::new(0, 10)));
    }

    #[test]
    fn test_successor_bumps_version() {
        let (book, _) = book_with(&["a"]);
        let next = book.successor();
        assert_eq!(book.version, 0);
        assert_eq!(next.version, 1);
        assert_eq!(next.active_count(), 1);
    }

    #[test]
    fn test_insert_unknown_parent_fails() {
        let (mut book, _) = book_with(&["a"]);
        let orphan = Code::discovered("b", "d", 0.5, "r").with_parent(CodeId::new());
        assert!(matches!(
            book.insert(orphan),
            Err(QualError::UnknownCode(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut book, ids) = book_with(&["theme", "category"]);
        book.set_parent(&ids[1], Some(ids[0])).unwrap();
        let err = book.set_parent(&ids[0], Some(ids[1]));
        assert!(matches!(err, Err(QualError::Invariant(_))));
    }

    #[test]
    fn test_self_parent_rejected() {
        let (mut book, ids) = book_with(&["a"]);
        assert!(matches!(
            book.set_parent(&ids[0], Some(ids[0])),
            Err(QualError::Invariant(_))
        ));
    }

    #[test]
    fn test_find_by_name_normalized() {
        let (book, ids) = book_with(&["Trust Issues"]);
        assert_eq!(book.find_by_name("trust_issues").map(|c| c.id), Some(ids[0]));
        assert_eq!(book.find_by_name("TRUST  ISSUES").map(|c| c.id), Some(ids[0]));
        assert!(book.find_by_name("distrust").is_none());
    }

    #[test]
    fn test_roots_and_children() {
        let (mut book, ids) = book_with(&["theme", "leaf"]);
        book.set_parent(&ids[1], Some(ids[0])).unwrap();
        let roots: Vec<_> = book.roots().map(|c| c.id).collect();
        assert_eq!(roots, vec![ids[0]]);
        let children: Vec<_> = book.children(&ids[0]).iter().map(|c| c.id).collect();
        assert_eq!(children, vec![ids[1]]);
    }
}
