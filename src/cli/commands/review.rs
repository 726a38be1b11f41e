//! Review Command
//!
//! Inspect the pending review queue and apply human decisions to it.
//! Decisions arrive as a JSON file holding an array of decision objects,
//! e.g. `[{"kind": "approve", "code_ids": ["..."]}]`.

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::review::ReviewManager;
use crate::types::{PipelineStatus, QualError, Result, ReviewDecision};

/// List pending review items.
pub fn list(project: &str) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;
    let state = ctx.project(project)?;

    if state.review_queue.is_empty() {
        out.info("No pending review items.");
        return Ok(());
    }

    let stage = match &state.progress.status {
        PipelineStatus::AwaitingReview { stage } => stage.as_str(),
        _ => "unknown",
    };
    out.section(&format!("Pending review ({} stage)", stage));
    for item in &state.review_queue {
        println!("  code {}", item.code_id);
        println!("    {}", item.summary);
    }
    println!();
    println!("Every listed code must be covered by a decision before the run resumes.");

    Ok(())
}

/// Apply decisions from a JSON file and persist the advanced state.
pub fn submit(project: &str, decisions_path: &Path) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;
    let mut state = ctx.project(project)?;

    let raw = std::fs::read_to_string(decisions_path).map_err(|e| {
        QualError::Config(format!(
            "cannot read '{}': {}",
            decisions_path.display(),
            e
        ))
    })?;
    let decisions: Vec<ReviewDecision> = serde_json::from_str(&raw).map_err(|e| {
        QualError::Review(format!(
            "'{}' is not a valid decision list: {}",
            decisions_path.display(),
            e
        ))
    })?;

    let outcome = ReviewManager.submit_decisions(&mut state, &decisions)?;
    ctx.db.save_project(&state)?;
    ctx.db.append_audit(&state.id, &outcome.audit)?;

    out.success(&format!(
        "{} item(s) resolved; codebook advanced to v{}",
        outcome.resolved, state.codebook.version
    ));
    for record in &outcome.audit {
        println!("  v{}: {} ({})", record.version, record.action, record.detail);
    }
    println!();
    println!("Resume with 'qualweave run --project {}'.", project);

    Ok(())
}
