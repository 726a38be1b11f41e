//! Config Command
//!
//! Show, locate, and initialize configuration files.

use crate::config::ConfigLoader;
use crate::types::Result;

/// Show current merged configuration
pub fn show(format: &str) -> Result<()> {
    ConfigLoader::show_config(format == "json")
}

/// Show configuration file paths
pub fn path() -> Result<()> {
    ConfigLoader::show_path();
    Ok(())
}

/// Initialize global configuration
pub fn init_global(force: bool) -> Result<()> {
    let dir = ConfigLoader::init_global(force)?;
    println!("✓ Global config initialized: {}", dir.display());
    Ok(())
}

/// Initialize project configuration
pub fn init_project() -> Result<()> {
    let dir = ConfigLoader::init_project(None)?;
    println!("✓ Project config initialized: {}", dir.display());
    Ok(())
}
