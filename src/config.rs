use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cascade_config::{CONFIG_FILE, CascadeToml};

/// Runtime configuration: resolved paths plus the layered cascade.toml
/// (file, then `CASCADE_*` environment, then CLI flags).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `.cascade/` inside the project
    pub state_dir: PathBuf,
    pub registry_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: CascadeToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, registry: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let state_dir = project_dir.join(".cascade");

        let mut toml = CascadeToml::load_or_default(&state_dir)?;
        toml.apply_env()?;

        let registry_path = match registry {
            Some(path) if path.is_absolute() => path,
            Some(path) => project_dir.join(path),
            None => project_dir.join("sources.json"),
        };

        Ok(Self {
            checkpoint_dir: state_dir.join("checkpoints"),
            log_dir: state_dir.join("logs"),
            registry_path,
            state_dir,
            project_dir,
            verbose,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)
            .context("Failed to create checkpoint directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Default output directory for a newly registered item.
    pub fn default_output_dir(&self, item_id: &str) -> PathBuf {
        self.project_dir
            .join("output")
            .join(crate::util::path_component(item_id))
    }

    /// Resolve a user-supplied path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}
