//! Stats Commands
//!
//! Reliability runs (inter-rater and stability) over a project's documents.
//! Reports are printed and stored alongside the project.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::gateway::build_gateway;
use crate::stats::{ReliabilityEngine, ReliabilityReport};
use crate::types::Result;

/// Inter-rater reliability: repeated perturbed passes with one model, or one
/// pass per model when `--model` is given more than once.
pub async fn irr(project: &str, passes: usize, models: &[String]) -> Result<()> {
    let ctx = CommandContext::load()?;
    let state = ctx.project(project)?;
    let engine = ReliabilityEngine::new(
        ctx.config.pipeline.retry.policy(),
        ctx.config.pipeline.concurrency,
    );

    let report = if models.len() >= 2 {
        let gateways = models
            .iter()
            .map(|model| build_gateway(&with_model(&ctx.config.gateway, model)))
            .collect::<Result<Vec<_>>>()?;
        engine.run_irr_models(&state, &gateways).await?
    } else {
        let gateway_config = match models.first() {
            Some(model) => with_model(&ctx.config.gateway, model),
            None => ctx.config.gateway.clone(),
        };
        let gateway = build_gateway(&gateway_config)?;
        engine.run_irr(&state, gateway, passes).await?
    };

    ctx.db.store_reliability_report(&state.id, &report)?;
    print_report(&report);
    Ok(())
}

/// Stability: same prompt and model, varied seed and temperature.
pub async fn stability(project: &str, passes: usize) -> Result<()> {
    let ctx = CommandContext::load()?;
    let state = ctx.project(project)?;
    let gateway = build_gateway(&ctx.config.gateway)?;
    let engine = ReliabilityEngine::new(
        ctx.config.pipeline.retry.policy(),
        ctx.config.pipeline.concurrency,
    );

    let report = engine.run_stability(&state, gateway, passes).await?;
    ctx.db.store_reliability_report(&state.id, &report)?;
    print_report(&report);
    Ok(())
}

fn with_model(base: &crate::config::GatewayConfig, model: &str) -> crate::config::GatewayConfig {
    let mut config = base.clone();
    config.model = Some(model.to_string());
    config
}

fn print_report(report: &ReliabilityReport) {
    let out = Output::new();
    out.section(&format!("Reliability report ({:?})", report.kind));
    out.field("Passes", &report.passes.join(", "));
    out.field("Documents", &report.documents.to_string());

    println!();
    for pair in &report.pairwise {
        let kappa = pair
            .kappa
            .value()
            .map(|k| format!("{:.3}", k))
            .unwrap_or_else(|| "undefined".to_string());
        println!(
            "  {} vs {}: {:.1}% agreement over {} units, κ = {} ({})",
            pair.pass_a,
            pair.pass_b,
            pair.percent_agreement * 100.0,
            pair.total_units,
            kappa,
            pair.band
        );
    }

    println!();
    match report.overall.value() {
        Some(k) => out.success(&format!("Overall κ = {:.3} ({})", k, report.band)),
        None => out.warning(&format!(
            "Overall κ undefined ({}); raters produced no comparable variation",
            report.band
        )),
    }
}
