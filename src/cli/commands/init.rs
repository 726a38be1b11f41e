//! Init Command
//!
//! Initialize QualWeave in the current directory.

use crate::cli::util;
use crate::config::ConfigLoader;
use crate::types::{QualError, Result};

pub fn run(force: bool) -> Result<()> {
    let root = std::env::current_dir()?;
    let qualweave_dir = util::qualweave_dir();

    if qualweave_dir.exists() && !force {
        return Err(QualError::Config(
            "Already initialized. Use --force to overwrite.".to_string(),
        ));
    }

    // Get default study name from directory
    let study_name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("study")
        .to_string();

    // Initialize project directory structure and config
    ConfigLoader::init_project(Some(&study_name))?;

    // Initialize global config if not exists (don't force overwrite)
    if let Err(e) = ConfigLoader::init_global(false) {
        tracing::debug!("Global config init skipped: {}", e);
    }

    // Initialize database at the default location
    util::create_db(&crate::config::Config::default())?;

    println!("✓ Initialized QualWeave in .qualweave/");
    println!("  Study: {}", study_name);
    println!();
    println!("Next steps:");
    println!("  1. Ingest transcripts:  qualweave ingest --project {} interviews/*.txt", study_name);
    println!("  2. Run the analysis:    qualweave run --project {}", study_name);

    Ok(())
}
