//! Core Domain Types
//!
//! Newtypes, the codebook model, project state, and review types shared by
//! every subsystem. All ids are UUID-backed newtypes so that code ids,
//! document ids, and application ids cannot be mixed up at compile time.

pub mod codebook;
pub mod error;
pub mod project;
pub mod review;

pub use codebook::{Code, Codebook, CodeApplication, Provenance, Span};
pub use error::{GatewayError, QualError, Result, ResultExt};
pub use project::{
    Document, Memo, PipelineProgress, PipelineStatus, ProjectState, Segment, StateDelta,
};
pub use review::{AuditRecord, ReviewDecision, ReviewItem, ReviewItemStatus, SplitGroup};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Id Newtypes
// =============================================================================

macro_rules! uuid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(
    /// Type-safe wrapper for project ids.
    ProjectId
);
uuid_newtype!(
    /// Type-safe wrapper for document ids.
    DocumentId
);
uuid_newtype!(
    /// Type-safe wrapper for code ids.
    CodeId
);
uuid_newtype!(
    /// Type-safe wrapper for code-application ids.
    ApplicationId
);
uuid_newtype!(
    /// Type-safe wrapper for review-item ids.
    ReviewItemId
);

// =============================================================================
// Code Name Normalization
// =============================================================================

/// Normalize a code name for identity comparison.
///
/// Conservative default: lowercase, trim, collapse internal whitespace and
/// underscores to single underscores. Two codes are "the same" for agreement
/// matching only when their normalized names are equal (semantic matching is
/// an explicit opt-in enhancement, not implemented here).
pub fn normalize_code_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for ch in name.trim().chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            if !last_sep {
                out.push('_');
                last_sep = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_sep = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
