//! Status Command
//!
//! Display project status, or list every project when none is named.

use crate::cli::ui::Output;
use crate::cli::util::{is_initialized, CommandContext};
use crate::types::{PipelineStatus, Result};

pub fn run(project: Option<&str>, format: &str) -> Result<()> {
    let json_output = format == "json";

    if !is_initialized() {
        if json_output {
            println!("{{\"status\": \"not_initialized\"}}");
        } else {
            println!("QualWeave Status");
            println!("══════════════════════════════════════");
            println!("Not initialized. Run 'qualweave init' first.");
        }
        // Informational command: not an error
        return Ok(());
    }

    let ctx = CommandContext::load()?;
    match project {
        Some(name) => show_project(&ctx, name, json_output),
        None => list_projects(&ctx, json_output),
    }
}

fn list_projects(ctx: &CommandContext, json_output: bool) -> Result<()> {
    let projects = ctx.db.list_projects()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&projects)?);
        return Ok(());
    }

    println!("QualWeave Status");
    println!("══════════════════════════════════════");
    if projects.is_empty() {
        println!("No projects yet. Run 'qualweave ingest' to create one.");
        return Ok(());
    }

    for summary in &projects {
        let saturated = if summary.saturated { " [saturated]" } else { "" };
        // The status column stores the serialized PipelineStatus.
        let status = serde_json::from_str::<PipelineStatus>(&summary.status)
            .map(|s| describe_status(&s))
            .unwrap_or_else(|_| summary.status.clone());
        println!(
            "  {} ({}): {}{}",
            summary.name, summary.methodology, status, saturated
        );
    }
    println!();
    println!("Use 'qualweave status --project <name>' for details.");

    Ok(())
}

fn show_project(ctx: &CommandContext, name: &str, json_output: bool) -> Result<()> {
    let out = Output::new();
    let state = ctx.project(name)?;
    let coded = state.documents.iter().filter(|d| d.coded).count();

    if json_output {
        let status = serde_json::json!({
            "project": state.name,
            "methodology": state.methodology,
            "status": state.progress.status,
            "documents": {
                "total": state.documents.len(),
                "coded": coded,
            },
            "codebook": {
                "version": state.codebook.version,
                "active_codes": state.codebook.active_count(),
            },
            "applications": state.applications.len(),
            "memos": state.memos.len(),
            "pending_review_items": state.review_queue.len(),
            "saturated": state.saturated,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    out.header(&format!("Project: {}", state.name));
    out.field("Methodology", &state.methodology.to_string());
    out.field("Status", &describe_status(&state.progress.status));
    out.field(
        "Documents",
        &format!("{} ({} coded)", state.documents.len(), coded),
    );
    out.field(
        "Codebook",
        &format!(
            "v{}, {} active code(s)",
            state.codebook.version,
            state.codebook.active_count()
        ),
    );
    out.field("Applications", &state.applications.len().to_string());
    out.field("Memos", &state.memos.len().to_string());
    if state.saturated {
        out.field("Saturation", "reached");
    }

    if !state.review_queue.is_empty() {
        println!();
        out.warning(&format!(
            "{} review item(s) pending; run 'qualweave review --project {} --list'",
            state.review_queue.len(),
            name
        ));
    }

    Ok(())
}

fn describe_status(status: &PipelineStatus) -> String {
    match status {
        PipelineStatus::Pending => "pending".to_string(),
        PipelineStatus::Running { stage } => format!("running ({})", stage),
        PipelineStatus::AwaitingReview { stage } => format!("awaiting review ({})", stage),
        PipelineStatus::Failed { stage, kind } => format!("failed at {} ({})", stage, kind),
        PipelineStatus::Done => "done".to_string(),
    }
}
