//! Project State
//!
//! `ProjectState` is the single document every stage reads and writes. It is
//! owned exclusively by the pipeline during a run and persisted as a whole
//! snapshot between runs. All mutation is routed through [`ProjectState::apply_delta`];
//! stage code never gets raw field setters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::methodology::Methodology;

use super::codebook::{Code, CodeApplication, Codebook, Provenance, Span};
use super::error::{QualError, Result};
use super::review::ReviewItem;
use super::{CodeId, DocumentId, ProjectId};

// =============================================================================
// Document
// =============================================================================

/// One speaker turn or paragraph within a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Detected speaker label, if the transcript carries one.
    pub speaker: Option<String>,
    pub text: String,
    /// Char span of `text` within the document's raw text.
    pub span: Span,
}

/// An ingested transcript. Raw text is immutable after ingest; detected
/// segments and the `coded` flag are derived and change only via a stage
/// delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub text: String,
    pub segments: Vec<Segment>,
    pub coded: bool,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>, text: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            id: DocumentId::new(),
            title: title.into(),
            text: text.into(),
            segments,
            coded: false,
            ingested_at: Utc::now(),
        }
    }
}

// =============================================================================
// Memo
// =============================================================================

/// Analytical memo attached to the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub id: Uuid,
    pub text: String,
    pub author: Provenance,
    pub created_at: DateTime<Utc>,
}

impl Memo {
    pub fn llm(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            author: Provenance::Llm,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Pipeline Progress
// =============================================================================

/// Serializable pipeline state machine position. `AwaitingReview` is the
/// suspend point: it survives persistence and can be resumed by a separate
/// process once decisions arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running { stage: String },
    AwaitingReview { stage: String },
    Failed { stage: String, kind: String },
    Done,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub status: PipelineStatus,
    /// Index of the next stage to run in the methodology's stage list.
    pub next_stage: usize,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self {
            status: PipelineStatus::Pending,
            next_stage: 0,
        }
    }
}

// =============================================================================
// State Delta
// =============================================================================

/// The atomic unit of state mutation. A stage returns one delta; the
/// pipeline validates and commits it all-or-nothing, so a failure part-way
/// through a stage never leaves `ProjectState` partially mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Newly discovered codes appended to the codebook.
    pub new_codes: Vec<Code>,
    /// Re-parenting of existing codes (axial coding).
    pub parent_updates: Vec<(CodeId, Option<CodeId>)>,
    /// Definition refinements of existing codes (constant comparison).
    pub definition_updates: Vec<(CodeId, String)>,
    /// New quote-to-code links.
    pub new_applications: Vec<CodeApplication>,
    /// Detected segments for documents (segmentation stage).
    pub segment_updates: Vec<(DocumentId, Vec<Segment>)>,
    /// Documents to flag as coded.
    pub mark_coded: Vec<DocumentId>,
    /// Analytical memos to append.
    pub memos: Vec<Memo>,
    /// Named stage outputs consumed by downstream stages via `require`.
    pub outputs: BTreeMap<String, Value>,
    /// Set when saturation was reached while producing this delta.
    pub mark_saturated: bool,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.new_codes.is_empty()
            && self.parent_updates.is_empty()
            && self.definition_updates.is_empty()
            && self.new_applications.is_empty()
            && self.segment_updates.is_empty()
            && self.mark_coded.is_empty()
            && self.memos.is_empty()
            && self.outputs.is_empty()
            && !self.mark_saturated
    }

    /// Whether this delta touches the codebook (and thus bumps its version).
    pub fn touches_codebook(&self) -> bool {
        !self.new_codes.is_empty()
            || !self.parent_updates.is_empty()
            || !self.definition_updates.is_empty()
    }
}

// =============================================================================
// Project State
// =============================================================================

/// The project's entire analytical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: ProjectId,
    pub name: String,
    pub methodology: Methodology,
    pub documents: Vec<Document>,
    pub codebook: Codebook,
    pub applications: Vec<CodeApplication>,
    pub memos: Vec<Memo>,
    /// Outstanding review items for the checkpointed stage.
    pub review_queue: Vec<ReviewItem>,
    /// Proposed delta held unapplied while awaiting review.
    pub pending_delta: Option<StateDelta>,
    pub progress: PipelineProgress,
    /// Named outputs of completed stages.
    pub stage_outputs: BTreeMap<String, Value>,
    /// Set once saturation was signaled; sampling and incremental coding
    /// consult this flag.
    pub saturated: bool,
    /// Codebook snapshots advanced since the last save. The storage layer
    /// records one history row per entry; not serialized, since a loaded
    /// snapshot's prior versions are already in the database.
    #[serde(skip)]
    pub version_log: Vec<Codebook>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(name: impl Into<String>, methodology: Methodology) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            methodology,
            documents: Vec::new(),
            codebook: Codebook::new(),
            applications: Vec::new(),
            memos: Vec::new(),
            review_queue: Vec::new(),
            pending_delta: None,
            progress: PipelineProgress::default(),
            stage_outputs: BTreeMap::new(),
            saturated: false,
            version_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ingest a document. Documents are append-only; they are never deleted,
    /// only flagged coded/uncoded.
    pub fn add_document(&mut self, document: Document) {
        self.documents.push(document);
        self.updated_at = Utc::now();
    }

    pub fn document(&self, id: &DocumentId) -> Result<&Document> {
        self.documents
            .iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| QualError::UnknownDocument(id.to_string()))
    }

    pub fn uncoded_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter().filter(|d| !d.coded)
    }

    pub fn applications_for_code(&self, code_id: &CodeId) -> Vec<&CodeApplication> {
        self.applications
            .iter()
            .filter(|a| &a.code_id == code_id)
            .collect()
    }

    /// Install a successor codebook produced by a review decision, buffering
    /// the snapshot so storage records the version even when several
    /// decisions land between saves.
    pub(crate) fn commit_codebook(&mut self, book: Codebook) {
        self.codebook = book;
        self.version_log.push(self.codebook.clone());
        self.updated_at = Utc::now();
    }

    /// Apply a stage delta atomically.
    ///
    /// Validation runs entirely against scratch copies; only once every part
    /// of the delta has been proven valid are the fields committed. On error
    /// the state is exactly as it was before the call.
    pub fn apply_delta(&mut self, delta: &StateDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }

        // Build the successor codebook first; every codebook-touching part of
        // the delta must succeed against it before anything is committed.
        let mut next_book = if delta.touches_codebook() {
            Some(self.codebook.successor())
        } else {
            None
        };

        if let Some(book) = next_book.as_mut() {
            for code in &delta.new_codes {
                book.insert(code.clone())?;
            }
            for (id, parent) in &delta.parent_updates {
                book.set_parent(id, *parent)?;
            }
            for (id, definition) in &delta.definition_updates {
                book.get_mut(id)?.definition = definition.clone();
            }
        }

        // Applications must reference codes known to the (possibly updated)
        // codebook and documents that exist.
        let effective_book = next_book.as_ref().unwrap_or(&self.codebook);
        for app in &delta.new_applications {
            effective_book.require(&app.code_id)?;
            self.document(&app.document_id)?;
        }
        for doc_id in &delta.mark_coded {
            self.document(doc_id)?;
        }
        for (doc_id, _) in &delta.segment_updates {
            self.document(doc_id)?;
        }

        // Commit.
        if let Some(book) = next_book {
            self.codebook = book;
            self.version_log.push(self.codebook.clone());
        }
        let version = self.codebook.version;
        self.applications.extend(delta.new_applications.iter().map(|a| {
            let mut app = a.clone();
            app.codebook_version = version;
            app
        }));
        for (doc_id, segments) in &delta.segment_updates {
            if let Some(doc) = self.documents.iter_mut().find(|d| &d.id == doc_id) {
                doc.segments = segments.clone();
            }
        }
        for doc_id in &delta.mark_coded {
            if let Some(doc) = self.documents.iter_mut().find(|d| &d.id == doc_id) {
                doc.coded = true;
            }
        }
        self.memos.extend(delta.memos.iter().cloned());
        for (key, value) in &delta.outputs {
            self.stage_outputs.insert(key.clone(), value.clone());
        }
        if delta.mark_saturated {
            self.saturated = true;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_doc() -> (ProjectState, DocumentId) {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        let doc = Document::new("interview-1", "hello world", vec![]);
        let id = doc.id;
        state.add_document(doc);
        (state, id)
    }

    #[test]
    fn test_apply_delta_appends_codes_and_bumps_version() {
        let (mut state, doc_id) = state_with_doc();
        let code = Code::discovered("trust issues", "d", 0.8, "r");
        let code_id = code.id;
        let delta = StateDelta {
            new_codes: vec![code],
            new_applications: vec![CodeApplication::new(
                code_id,
                doc_id,
                Span::new(0, 5),
                "hello",
                0,
            )],
            mark_coded: vec![doc_id],
            ..Default::default()
        };

        state.apply_delta(&delta).unwrap();
        assert_eq!(state.codebook.version, 1);
        assert_eq!(state.applications.len(), 1);
        assert_eq!(state.applications[0].codebook_version, 1);
        assert!(state.document(&doc_id).unwrap().coded);
    }

    #[test]
    fn test_apply_delta_atomic_on_failure() {
        let (mut state, doc_id) = state_with_doc();
        let code = Code::discovered("a", "d", 0.8, "r");
        let delta = StateDelta {
            new_codes: vec![code],
            // References a code that exists nowhere: the whole delta must fail
            new_applications: vec![CodeApplication::new(
                CodeId::new(),
                doc_id,
                Span::new(0, 5),
                "hello",
                0,
            )],
            ..Default::default()
        };

        let before = state.clone();
        assert!(state.apply_delta(&delta).is_err());
        assert_eq!(state.codebook.version, before.codebook.version);
        assert_eq!(state.applications.len(), 0);
        assert_eq!(state.codebook.active_count(), 0);
    }

    #[test]
    fn test_apply_delta_unknown_document_fails() {
        let (mut state, _) = state_with_doc();
        let delta = StateDelta {
            mark_coded: vec![DocumentId::new()],
            ..Default::default()
        };
        assert!(matches!(
            state.apply_delta(&delta),
            Err(QualError::UnknownDocument(_))
        ));
    }

    #[test]
    fn test_empty_delta_is_noop() {
        let (mut state, _) = state_with_doc();
        let version = state.codebook.version;
        state.apply_delta(&StateDelta::default()).unwrap();
        assert_eq!(state.codebook.version, version);
    }

    #[test]
    fn test_outputs_merge_into_stage_outputs() {
        let (mut state, _) = state_with_doc();
        let mut delta = StateDelta::default();
        delta
            .outputs
            .insert("core_category".into(), serde_json::json!("trust"));
        state.apply_delta(&delta).unwrap();
        assert_eq!(
            state.stage_outputs.get("core_category"),
            Some(&serde_json::json!("trust"))
        );
    }
}
