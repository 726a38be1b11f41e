//! Review Types
//!
//! Human-review decisions, the review items a stage raises at a checkpoint,
//! and the append-only audit trail written alongside every codebook version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApplicationId, CodeId, ReviewItemId};

// =============================================================================
// Review Items
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewItemStatus {
    Pending,
    Resolved,
}

/// One question raised for the human reviewer at a stage checkpoint.
/// The pipeline may only resume once every pending item is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: ReviewItemId,
    /// Stage that raised the item.
    pub stage: String,
    /// Code the item concerns.
    pub code_id: CodeId,
    /// Human-facing summary of what is being asked.
    pub summary: String,
    pub status: ReviewItemStatus,
}

impl ReviewItem {
    pub fn new(stage: impl Into<String>, code_id: CodeId, summary: impl Into<String>) -> Self {
        Self {
            id: ReviewItemId::new(),
            stage: stage.into(),
            code_id,
            summary: summary.into(),
            status: ReviewItemStatus::Pending,
        }
    }
}

// =============================================================================
// Review Decisions
// =============================================================================

/// A human decision over one or more codes. Applying a decision is the only
/// way the codebook advances a version during review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Confirm codes as-is; provenance flips to human-confirmed.
    Approve { code_ids: Vec<CodeId> },
    /// Remove codes from the active version; their applications are
    /// cascade-rejected (surfaced as warnings, never dropped silently).
    Reject { code_ids: Vec<CodeId> },
    /// Replace a code's definition.
    Modify {
        code_id: CodeId,
        new_definition: String,
    },
    /// Fold several codes into one new code owning the deduplicated union of
    /// their applications; originals are superseded, not deleted.
    Merge {
        code_ids: Vec<CodeId>,
        target_name: String,
    },
    /// Partition one code's applications into named groups, one new code per
    /// group. The partition must cover every application exactly once.
    Split {
        code_id: CodeId,
        partition: Vec<SplitGroup>,
    },
}

/// One group of a split partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitGroup {
    pub name: String,
    pub definition: String,
    pub application_ids: Vec<ApplicationId>,
}

impl ReviewDecision {
    /// Codes this decision targets, for matching against review items.
    pub fn target_codes(&self) -> Vec<CodeId> {
        match self {
            Self::Approve { code_ids } | Self::Reject { code_ids } | Self::Merge { code_ids, .. } => {
                code_ids.clone()
            }
            Self::Modify { code_id, .. } | Self::Split { code_id, .. } => vec![*code_id],
        }
    }

    /// Audit-log action tag.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Modify { .. } => "modify",
            Self::Merge { .. } => "merge",
            Self::Split { .. } => "split",
        }
    }
}

// =============================================================================
// Audit Trail
// =============================================================================

/// One audit record per codebook version advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Codebook version this record produced.
    pub version: u64,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(version: u64, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            version,
            action: action.into(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_targets() {
        let a = CodeId::new();
        let b = CodeId::new();
        let merge = ReviewDecision::Merge {
            code_ids: vec![a, b],
            target_name: "merged".into(),
        };
        assert_eq!(merge.target_codes(), vec![a, b]);
        assert_eq!(merge.action(), "merge");

        let split = ReviewDecision::Split {
            code_id: a,
            partition: vec![],
        };
        assert_eq!(split.target_codes(), vec![a]);
    }

    #[test]
    fn test_decision_serde_tagging() {
        let d = ReviewDecision::Approve {
            code_ids: vec![CodeId::new()],
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "approve");
    }
}
