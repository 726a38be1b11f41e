//! Sample Command
//!
//! Theoretical sampling advice: which uncoded documents to analyze next.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::sampling::TheoreticalSamplingAdvisor;
use crate::types::Result;

pub fn run(project: &str, limit: usize) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;
    let state = ctx.project(project)?;

    let recommendations = TheoreticalSamplingAdvisor.recommend(&state)?;

    if state.saturated {
        out.info("Project is saturated; no further sampling recommended.");
        return Ok(());
    }
    if recommendations.is_empty() {
        out.info("Nothing to recommend: no uncoded documents, or every code is well developed.");
        return Ok(());
    }

    out.section("Sampling recommendations");
    for (rank, rec) in recommendations.iter().take(limit).enumerate() {
        println!("  {}. {} (score {:.3})", rank + 1, rec.title, rec.score);
        println!("     {}", rec.rationale);
    }

    Ok(())
}
