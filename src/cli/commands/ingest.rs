//! Ingest Command
//!
//! Add transcript files to a project, creating the project on first use.
//! Raw text is stored verbatim; segmentation happens later as a pipeline
//! stage.

use std::path::{Path, PathBuf};

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::pipeline::Methodology;
use crate::types::{Document, ProjectState, QualError, Result};

pub fn run(project: &str, methodology: Methodology, files: &[PathBuf]) -> Result<()> {
    let out = Output::new();
    let ctx = CommandContext::load()?;

    if files.is_empty() {
        return Err(QualError::Config("no files to ingest".to_string()));
    }

    let mut state = match ctx.db.find_project_by_name(project) {
        Ok(state) => state,
        Err(QualError::ProjectNotFound(_)) => {
            out.info(&format!(
                "Creating project '{}' ({})",
                project, methodology
            ));
            ProjectState::new(project, methodology)
        }
        Err(e) => return Err(e),
    };

    let mut added = 0usize;
    for path in files {
        let document = read_document(path)?;
        if state.documents.iter().any(|d| d.title == document.title) {
            out.warning(&format!(
                "Skipping '{}': a document with that title already exists",
                document.title
            ));
            continue;
        }
        out.success(&format!(
            "Ingested '{}' ({} chars)",
            document.title,
            document.text.len()
        ));
        state.add_document(document);
        added += 1;
    }

    ctx.db.save_project(&state)?;

    println!();
    println!(
        "{} document(s) added; project '{}' now has {} total.",
        added,
        project,
        state.documents.len()
    );

    Ok(())
}

/// Read one transcript file. The document title is the file stem.
fn read_document(path: &Path) -> Result<Document> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        QualError::Config(format!("cannot read '{}': {}", path.display(), e))
    })?;

    if text.trim().is_empty() {
        return Err(QualError::Config(format!(
            "'{}' is empty",
            path.display()
        )));
    }

    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string();

    Ok(Document::new(title, text, vec![]))
}
