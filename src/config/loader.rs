//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/qualweave/config.toml)
//! 3. Project config (.qualweave/config.toml)
//! 4. Environment variables (QUALWEAVE_* prefix)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{QualError, Result};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain using Figment:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Merge global config
        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        // Merge project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // Merge environment variables (e.g., QUALWEAVE_GATEWAY_MODEL -> gateway.model)
        figment = figment.merge(Env::prefixed("QUALWEAVE_").split('_').lowercase(true));

        let config: Config = figment
            .extract()
            .map_err(|e| QualError::Config(format!("Configuration error: {}", e)))?;

        // Validate configuration after loading
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| QualError::Config(format!("Configuration error: {}", e)))
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory (~/.config/qualweave/)
    pub fn global_dir() -> Option<PathBuf> {
        env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join(".config"))
            })
            .map(|p| p.join("qualweave"))
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".qualweave/config.toml")
    }

    /// Get project data directory
    pub fn project_dir() -> PathBuf {
        PathBuf::from(".qualweave")
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Show config file path
    pub fn show_path() {
        println!("Configuration paths:");
        println!();

        // Global config
        if let Some(global) = Self::global_config_path() {
            let exists = if global.exists() { "✓" } else { "✗" };
            println!("  Global:  {} {}", exists, global.display());
        } else {
            println!("  Global:  (not available)");
        }

        // Project config
        let project = Self::project_config_path();
        let exists = if project.exists() { "✓" } else { "✗" };
        println!("  Project: {} {}", exists, project.display());
    }

    /// Show current effective configuration
    pub fn show_config(as_json: bool) -> Result<()> {
        let config = Self::load()?;

        if as_json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            // Pretty print in TOML format
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| QualError::Config(e.to_string()))?
            );
        }

        Ok(())
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Initialize global configuration
    pub fn init_global(force: bool) -> Result<PathBuf> {
        let global_dir = Self::global_dir().ok_or_else(|| {
            QualError::Config("Cannot determine global config directory".to_string())
        })?;

        fs::create_dir_all(&global_dir)?;

        let config_path = global_dir.join("config.toml");
        if !config_path.exists() || force {
            let default_config = Self::default_global_config();
            fs::write(&config_path, default_config)?;
            info!("Created global config: {}", config_path.display());
        } else {
            info!("Global config exists: {}", config_path.display());
        }

        Ok(global_dir)
    }

    /// Initialize project configuration
    pub fn init_project(name: Option<&str>) -> Result<PathBuf> {
        let project_dir = Self::project_dir();

        fs::create_dir_all(&project_dir)?;
        fs::create_dir_all(project_dir.join("exports"))?;

        // Create default config if not exists
        let config_path = project_dir.join("config.toml");
        if !config_path.exists() {
            let default_config = Self::default_project_config(name);
            fs::write(&config_path, default_config)?;
            info!("Created project config: {}", config_path.display());
        }

        Ok(project_dir)
    }

    /// Check if project is initialized
    pub fn is_project_initialized() -> bool {
        Self::project_dir().exists()
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Generate default global config content (TOML)
    fn default_global_config() -> String {
        r#"# QualWeave Global Configuration
# User-wide defaults. Project settings in .qualweave/config.toml override these.

version = "1.0"

# LLM gateway settings
[gateway]
provider = "openai"
timeout_secs = 300
temperature = 0.3
"#
        .to_string()
    }

    /// Generate default project config content (TOML)
    fn default_project_config(name: Option<&str>) -> String {
        let project_name = name.unwrap_or("study");
        format!(
            r#"# QualWeave Project Configuration
# Project-specific settings that override global defaults.
# Project name: {}

version = "1.0"

# Coding pipeline
[pipeline]
concurrency = 4
human_review = true

# Saturation detection
[saturation]
growth_threshold = 0.10
consecutive_steps = 2

# Persistence
[storage]
db_path = ".qualweave/qualweave.db"
"#,
            project_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_default_config() {
        let config = ConfigLoader::load().unwrap();
        assert_eq!(config.version, "1.0");
    }

    #[test]
    fn test_init_project() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();

        ConfigLoader::init_project(Some("interview-study")).unwrap();

        assert!(PathBuf::from(".qualweave").exists());
        assert!(PathBuf::from(".qualweave/config.toml").exists());
        assert!(PathBuf::from(".qualweave/exports").exists());
    }

    #[test]
    fn test_env_override() {
        // SAFETY: This test runs in isolation
        unsafe {
            std::env::set_var("QUALWEAVE_GATEWAY_PROVIDER", "ollama");
        }
        let config = ConfigLoader::load().unwrap();
        assert_eq!(config.gateway.provider, "ollama");
        unsafe {
            std::env::remove_var("QUALWEAVE_GATEWAY_PROVIDER");
        }
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[pipeline]\nconcurrency = 8\nhuman_review = false\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.pipeline.concurrency, 8);
        assert!(!config.pipeline.human_review);
        // Unspecified sections keep defaults
        assert_eq!(config.gateway.provider, "openai");
    }
}
