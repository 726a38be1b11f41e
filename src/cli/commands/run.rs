//! Run Command
//!
//! Run (or resume) the analysis pipeline for a project. Suspends at review
//! checkpoints unless review is disabled.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::gateway::build_gateway;
use crate::pipeline::{AnalysisPipeline, PipelineOutcome};
use crate::types::Result;

pub async fn run(project: &str, no_review: bool) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;
    let mut state = ctx.project(project)?;

    let gateway = build_gateway(&ctx.config.gateway)?;
    out.info(&format!(
        "Using {} gateway, model '{}'",
        gateway.name(),
        gateway.model()
    ));

    let pipeline = AnalysisPipeline::new(gateway)
        .with_retry(ctx.config.pipeline.retry.policy())
        .with_concurrency(ctx.config.pipeline.concurrency)
        .with_saturation(ctx.config.saturation.detector_config())
        .with_human_review(ctx.config.pipeline.human_review && !no_review);

    let outcome = pipeline.run(&mut state).await?;
    ctx.db.save_project(&state)?;

    match outcome {
        PipelineOutcome::Done => {
            out.success(&format!(
                "Analysis complete: {} active codes at codebook v{}",
                state.codebook.active_count(),
                state.codebook.version
            ));
            if state.saturated {
                out.info("Saturation was reached during coding.");
            }
        }
        PipelineOutcome::AwaitingReview { stage, items } => {
            out.warning(&format!(
                "Paused at '{}' for review ({} item(s)):",
                stage,
                items.len()
            ));
            for item in &items {
                println!("  [{}] {}", item.code_id, item.summary);
            }
            println!();
            println!(
                "Resolve with 'qualweave review --project {} --decisions <file.json>',",
                project
            );
            println!("then re-run 'qualweave run --project {}'.", project);
        }
        PipelineOutcome::Failed {
            stage,
            kind,
            detail,
        } => {
            out.error(&format!("Stage '{}' failed ({}): {}", stage, kind, detail));
            println!("Progress up to the failed stage is saved; re-run to retry.");
        }
    }

    Ok(())
}
