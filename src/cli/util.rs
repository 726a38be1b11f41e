//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.
//! Eliminates duplicate code across command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, ConfigLoader};
use crate::storage::{Database, SharedDatabase};
use crate::types::{ProjectState, QualError, Result};

/// QualWeave directory name
pub const QUALWEAVE_DIR: &str = ".qualweave";

/// Command execution context
///
/// Provides unified access to common resources needed by CLI commands.
/// Created via `CommandContext::load()` after the workspace has been
/// initialized.
#[derive(Clone)]
pub struct CommandContext {
    /// QualWeave directory path (.qualweave)
    pub qualweave_dir: PathBuf,
    /// Shared database handle
    pub db: SharedDatabase,
    /// Loaded configuration
    pub config: Config,
}

impl CommandContext {
    /// Load full command context
    ///
    /// Validates initialization, loads config, and opens the database.
    pub fn load() -> Result<Self> {
        let qualweave_dir = require_initialized()?;
        let config = ConfigLoader::load()?;
        let db = open_db(&config)?;

        Ok(Self {
            qualweave_dir,
            db: Arc::new(db),
            config,
        })
    }

    /// Resolve a project by name, with a hint when it does not exist.
    pub fn project(&self, name: &str) -> Result<ProjectState> {
        self.db.find_project_by_name(name).map_err(|e| match e {
            QualError::ProjectNotFound(_) => QualError::ProjectNotFound(format!(
                "{} (run 'qualweave ingest --project {}' to create it)",
                name, name
            )),
            other => other,
        })
    }
}

/// Require QualWeave to be initialized
///
/// Returns the .qualweave directory path if initialized.
pub fn require_initialized() -> Result<PathBuf> {
    let dir = Path::new(QUALWEAVE_DIR);

    if !dir.exists() {
        return Err(QualError::Config(
            "Not initialized. Run 'qualweave init' first.".to_string(),
        ));
    }

    Ok(dir.to_path_buf())
}

/// Check if QualWeave is initialized
pub fn is_initialized() -> bool {
    Path::new(QUALWEAVE_DIR).exists()
}

/// Get QualWeave directory path (without validation)
pub fn qualweave_dir() -> PathBuf {
    PathBuf::from(QUALWEAVE_DIR)
}

/// Open the project database at the configured path
pub fn open_db(config: &Config) -> Result<Database> {
    if !config.storage.db_path.exists() {
        return Err(QualError::Config(
            "Database not found. Run 'qualweave init' first.".to_string(),
        ));
    }

    Database::open(&config.storage.db_path)
}

/// Create and initialize the project database
///
/// Creates the database directory if needed and initializes the schema.
pub fn create_db(config: &Config) -> Result<Database> {
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(&config.storage.db_path)?;
    db.initialize()?;

    Ok(db)
}

// Tests disabled: Changing current directory in tests causes race conditions
// when running tests in parallel. The functionality is tested through
// integration tests instead.
