//! Human Review
//!
//! Applies reviewer decisions to a project suspended at a review checkpoint.
//! The stage's proposed delta is committed first, then each decision advances
//! the codebook exactly one version and yields one audit record; the caller
//! persists the records alongside the snapshot. A run may only resume once
//! every queued item is covered by a decision.
//!
//! Codes are never silently lost: rejection cascade-removes applications with
//! a warning per application, merge supersedes the originals in place, and a
//! split must account for every application of the source code exactly once.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, instrument, warn};

use crate::types::{
    normalize_code_name, AuditRecord, Code, CodeApplication, CodeId, PipelineStatus, ProjectState,
    Provenance, QualError, Result, ReviewDecision, ReviewItemStatus, SplitGroup,
};

// =============================================================================
// Outcome
// =============================================================================

/// What a round of review produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    /// One record per codebook version advance, in order.
    pub audit: Vec<AuditRecord>,
    /// Number of review items resolved.
    pub resolved: usize,
}

// =============================================================================
// Review Manager
// =============================================================================

#[derive(Debug, Default)]
pub struct ReviewManager;

impl ReviewManager {
    /// Resolve a suspended checkpoint with the given decisions.
    ///
    /// Every pending review item must be covered by at least one decision
    /// targeting its code; partial coverage is rejected outright so a queue
    /// can never be half-resolved. On success the review queue is cleared and
    /// progress points at the stage after the checkpoint, ready for the
    /// pipeline to resume.
    #[instrument(skip_all, fields(project = %state.id, decisions = decisions.len()))]
    pub fn submit_decisions(
        &self,
        state: &mut ProjectState,
        decisions: &[ReviewDecision],
    ) -> Result<ReviewOutcome> {
        let stage = match &state.progress.status {
            PipelineStatus::AwaitingReview { stage } => stage.clone(),
            other => {
                return Err(QualError::Review(format!(
                    "project is not awaiting review (status: {:?})",
                    other
                )))
            }
        };

        let covered: BTreeSet<CodeId> = decisions
            .iter()
            .flat_map(|d| d.target_codes())
            .collect();
        let uncovered: Vec<&str> = state
            .review_queue
            .iter()
            .filter(|item| {
                item.status == ReviewItemStatus::Pending && !covered.contains(&item.code_id)
            })
            .map(|item| item.summary.as_str())
            .collect();
        if !uncovered.is_empty() {
            return Err(QualError::Review(format!(
                "unresolved review items: {}",
                uncovered.join("; ")
            )));
        }

        // Commit the checkpointed stage's proposal first; decisions refer to
        // codes it introduces.
        if let Some(delta) = state.pending_delta.take() {
            state.apply_delta(&delta)?;
        }

        let mut audit = Vec::with_capacity(decisions.len());
        for decision in decisions {
            audit.push(self.apply_decision(state, decision)?);
        }

        let resolved = state.review_queue.len();
        for item in &mut state.review_queue {
            item.status = ReviewItemStatus::Resolved;
        }
        state.review_queue.clear();
        state.progress.next_stage += 1;
        state.progress.status = PipelineStatus::Pending;
        info!(stage = %stage, resolved, "review checkpoint resolved");
        Ok(ReviewOutcome { audit, resolved })
    }

    /// Apply one decision: exactly one codebook version advance and one
    /// audit record. Validation happens against a successor copy, so a
    /// failing decision leaves the state untouched.
    pub fn apply_decision(
        &self,
        state: &mut ProjectState,
        decision: &ReviewDecision,
    ) -> Result<AuditRecord> {
        let detail = match decision {
            ReviewDecision::Approve { code_ids } => self.approve(state, code_ids)?,
            ReviewDecision::Reject { code_ids } => self.reject(state, code_ids)?,
            ReviewDecision::Modify {
                code_id,
                new_definition,
            } => self.modify(state, code_id, new_definition)?,
            ReviewDecision::Merge {
                code_ids,
                target_name,
            } => self.merge(state, code_ids, target_name)?,
            ReviewDecision::Split { code_id, partition } => {
                self.split(state, code_id, partition)?
            }
        };
        Ok(AuditRecord::new(
            state.codebook.version,
            decision.action(),
            detail,
        ))
    }

    fn approve(&self, state: &mut ProjectState, code_ids: &[CodeId]) -> Result<String> {
        let mut book = state.codebook.successor();
        let mut names = Vec::with_capacity(code_ids.len());
        for id in code_ids {
            let code = book.get_mut(id)?;
            code.provenance = Provenance::HumanConfirmed;
            names.push(code.name.clone());
        }
        state.commit_codebook(book);
        Ok(format!("approved: {}", names.join(", ")))
    }

    fn reject(&self, state: &mut ProjectState, code_ids: &[CodeId]) -> Result<String> {
        let mut book = state.codebook.successor();
        let rejected: BTreeSet<CodeId> = code_ids.iter().copied().collect();
        let mut names = Vec::with_capacity(code_ids.len());
        for id in code_ids {
            // Children move up to the rejected code's parent.
            let parent = book.require(id)?.parent;
            let children: Vec<CodeId> = book.children(id).iter().map(|c| c.id).collect();
            for child in children {
                book.set_parent(&child, parent)?;
            }
            let removed = book.remove(id)?;
            names.push(removed.name);
        }

        let before = state.applications.len();
        state.applications.retain(|app| {
            let keep = !rejected.contains(&app.code_id);
            if !keep {
                warn!(
                    application = %app.id,
                    document = %app.document_id,
                    quote = %app.quote,
                    "application dropped by code rejection"
                );
            }
            keep
        });
        let dropped = before - state.applications.len();
        state.commit_codebook(book);
        Ok(format!(
            "rejected: {} ({} application(s) dropped)",
            names.join(", "),
            dropped
        ))
    }

    fn modify(
        &self,
        state: &mut ProjectState,
        code_id: &CodeId,
        new_definition: &str,
    ) -> Result<String> {
        if new_definition.trim().is_empty() {
            return Err(QualError::Review("empty replacement definition".into()));
        }
        let mut book = state.codebook.successor();
        let code = book.get_mut(code_id)?;
        code.definition = new_definition.trim().to_string();
        code.provenance = Provenance::HumanConfirmed;
        let name = code.name.clone();
        state.commit_codebook(book);
        Ok(format!("modified definition of: {}", name))
    }

    fn merge(
        &self,
        state: &mut ProjectState,
        code_ids: &[CodeId],
        target_name: &str,
    ) -> Result<String> {
        if code_ids.len() < 2 {
            return Err(QualError::Review(
                "merge requires at least two source codes".into(),
            ));
        }
        let mut book = state.codebook.successor();
        let sources: BTreeSet<CodeId> = code_ids.iter().copied().collect();

        let normalized = normalize_code_name(target_name);
        if let Some(clash) = book
            .active_codes()
            .find(|c| c.normalized_name() == normalized && !sources.contains(&c.id))
        {
            return Err(QualError::Review(format!(
                "merge target name collides with active code '{}'",
                clash.name
            )));
        }

        // Shared parent survives; mixed parents flatten to root.
        let parents: BTreeSet<Option<CodeId>> = code_ids
            .iter()
            .map(|id| book.require(id).map(|c| c.parent))
            .collect::<Result<_>>()?;
        let parent = if parents.len() == 1 {
            parents.into_iter().next().unwrap_or(None)
        } else {
            None
        };

        let definitions: Vec<String> = code_ids
            .iter()
            .map(|id| book.require(id).map(|c| c.definition.clone()))
            .collect::<Result<_>>()?;
        let mut merged = Code::human(target_name, definitions.join("; "));
        if let Some(p) = parent {
            merged = merged.with_parent(p);
        }
        let merged_id = merged.id;
        book.insert(merged)?;

        let mut source_names = Vec::with_capacity(code_ids.len());
        for id in code_ids {
            let children: Vec<CodeId> = book.children(id).iter().map(|c| c.id).collect();
            for child in children {
                book.set_parent(&child, Some(merged_id))?;
            }
            let code = book.get_mut(id)?;
            code.superseded_by = Some(merged_id);
            source_names.push(code.name.clone());
        }

        // Re-point applications at the merged code, keeping one application
        // per (document, span) so overlapping sources do not double-count.
        let mut seen: BTreeSet<_> = state
            .applications
            .iter()
            .filter(|a| a.code_id == merged_id)
            .map(CodeApplication::span_key)
            .collect();
        let mut duplicates = 0usize;
        let mut retained = Vec::with_capacity(state.applications.len());
        for mut app in state.applications.drain(..) {
            if sources.contains(&app.code_id) {
                if !seen.insert(app.span_key()) {
                    duplicates += 1;
                    continue;
                }
                app.code_id = merged_id;
            }
            retained.push(app);
        }
        state.applications = retained;
        state.commit_codebook(book);
        Ok(format!(
            "merged {} into '{}' ({} duplicate application(s) collapsed)",
            source_names.join(", "),
            target_name,
            duplicates
        ))
    }

    fn split(
        &self,
        state: &mut ProjectState,
        code_id: &CodeId,
        partition: &[SplitGroup],
    ) -> Result<String> {
        if partition.len() < 2 {
            return Err(QualError::Review(
                "split requires at least two groups".into(),
            ));
        }
        let mut book = state.codebook.successor();
        let source = book.require(code_id)?.clone();

        let source_apps: BTreeSet<_> = state
            .applications
            .iter()
            .filter(|a| &a.code_id == code_id)
            .map(|a| a.id)
            .collect();

        // The partition must cover the source's applications exactly once.
        let mut assigned = BTreeMap::new();
        for (index, group) in partition.iter().enumerate() {
            if normalize_code_name(&group.name).is_empty() {
                return Err(QualError::Review("split group with empty name".into()));
            }
            for app_id in &group.application_ids {
                if !source_apps.contains(app_id) {
                    return Err(QualError::Review(format!(
                        "split group '{}' references application {} not belonging to '{}'",
                        group.name, app_id, source.name
                    )));
                }
                if assigned.insert(*app_id, index).is_some() {
                    return Err(QualError::Review(format!(
                        "application {} assigned to more than one split group",
                        app_id
                    )));
                }
            }
        }
        if assigned.len() != source_apps.len() {
            return Err(QualError::Review(format!(
                "split covers {} of {} applications of '{}'",
                assigned.len(),
                source_apps.len(),
                source.name
            )));
        }

        let mut group_ids = Vec::with_capacity(partition.len());
        for group in partition {
            let mut code = Code::human(&group.name, &group.definition);
            if let Some(p) = source.parent {
                code = code.with_parent(p);
            }
            group_ids.push(code.id);
            book.insert(code)?;
        }
        book.get_mut(code_id)?.superseded_by = Some(group_ids[0]);

        for app in &mut state.applications {
            if let Some(index) = assigned.get(&app.id) {
                app.code_id = group_ids[*index];
            }
        }
        state.commit_codebook(book);
        Ok(format!(
            "split '{}' into {} codes: {}",
            source.name,
            partition.len(),
            partition
                .iter()
                .map(|g| g.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
