//! Export Command
//!
//! Render a project's codebook as a Markdown document: the code forest with
//! definitions, provenance, and supporting quotes, plus analytical memos.

use std::fmt::Write as _;
use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::{Code, ProjectState, Provenance, Result, ResultExt};

pub fn run(project: &str, output: Option<&Path>, quotes: usize) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;
    let state = ctx.project(project)?;

    let markdown = render(&state, quotes);

    match output {
        Some(path) => {
            std::fs::write(path, &markdown)
                .with_context_fn(|| format!("Failed to write {}", path.display()))?;
            out.success(&format!("Codebook written to {}", path.display()));
        }
        None => print!("{}", markdown),
    }

    Ok(())
}

fn render(state: &ProjectState, quotes: usize) -> String {
    let mut md = String::new();

    let _ = writeln!(md, "# Codebook: {}", state.name);
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "Methodology: {} · Codebook v{} · {} active code(s) · {} application(s)",
        state.methodology,
        state.codebook.version,
        state.codebook.active_count(),
        state.applications.len()
    );
    if state.saturated {
        let _ = writeln!(md);
        let _ = writeln!(md, "Saturation was reached during coding.");
    }
    let _ = writeln!(md);

    let mut roots: Vec<&Code> = state.codebook.roots().collect();
    roots.sort_by(|a, b| a.name.cmp(&b.name));
    for root in roots {
        render_code(&mut md, state, root, 2, quotes);
    }

    if !state.memos.is_empty() {
        let _ = writeln!(md, "## Memos");
        let _ = writeln!(md);
        for memo in &state.memos {
            let _ = writeln!(md, "- {}", memo.text);
        }
        let _ = writeln!(md);
    }

    md
}

fn render_code(md: &mut String, state: &ProjectState, code: &Code, depth: usize, quotes: usize) {
    let heading = "#".repeat(depth.min(6));
    let _ = writeln!(md, "{} {}", heading, code.name);
    let _ = writeln!(md);
    let _ = writeln!(md, "{}", code.definition);
    let _ = writeln!(md);

    let applications = state.applications_for_code(&code.id);
    let _ = writeln!(
        md,
        "*{} · {} application(s)*",
        provenance_label(code.provenance),
        applications.len()
    );
    let _ = writeln!(md);

    for app in applications.iter().take(quotes) {
        let title = state
            .document(&app.document_id)
            .map(|d| d.title.clone())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = writeln!(md, "> {} ({})", app.quote.trim(), title);
        let _ = writeln!(md);
    }

    let mut children = state.codebook.children(&code.id);
    children.sort_by(|a, b| a.name.cmp(&b.name));
    for child in children {
        render_code(md, state, child, depth + 1, quotes);
    }
}

fn provenance_label(provenance: Provenance) -> &'static str {
    match provenance {
        Provenance::Llm => "LLM-discovered",
        Provenance::Human => "human-authored",
        Provenance::HumanConfirmed => "human-confirmed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Methodology;
    use crate::types::{CodeApplication, Document, Span, StateDelta};

    fn coded_project() -> ProjectState {
        let mut state = ProjectState::new("study", Methodology::GroundedTheory);
        let doc = Document::new("interview-1", "I stopped trusting the process", vec![]);
        let doc_id = doc.id;
        state.add_document(doc);

        let parent = Code::discovered("institutional trust", "theme", 0.9, "r");
        let parent_id = parent.id;
        let child =
            Code::discovered("trust erosion", "gradual loss of trust", 0.8, "r").with_parent(parent_id);
        let child_id = child.id;
        state
            .apply_delta(&StateDelta {
                new_codes: vec![parent, child],
                new_applications: vec![CodeApplication::new(
                    child_id,
                    doc_id,
                    Span::new(2, 30),
                    "stopped trusting the process",
                    0,
                )],
                ..Default::default()
            })
            .unwrap();
        state
    }

    #[test]
    fn test_render_nests_children_under_roots() {
        let state = coded_project();
        let md = render(&state, 3);
        let parent_pos = md.find("## institutional trust").unwrap();
        let child_pos = md.find("### trust erosion").unwrap();
        assert!(parent_pos < child_pos);
        assert!(md.contains("> stopped trusting the process"));
        assert!(md.contains("LLM-discovered"));
    }

    #[test]
    fn test_render_caps_quotes() {
        let state = coded_project();
        let md = render(&state, 0);
        assert!(!md.contains("> stopped trusting"));
    }
}
