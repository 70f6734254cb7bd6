//! Configuration view and validation commands: `cascade config`.

use anyhow::{Context, Result};

use cascade::cascade_config::CascadeToml;
use cascade::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Cascade Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cascade.toml at {} (using defaults)", config_path.display());
            }
            println!("Registry:    {}", config.registry_path.display());
            println!("Checkpoints: {}", config.checkpoint_dir.display());
            println!("Logs:        {}", config.log_dir.display());
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("Executor flags: {}", config.toml.executor.effective_flags().join(" "));
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let errors = config.toml.validate();
            if errors.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }
            println!("Configuration problems:");
            for error in &errors {
                println!("  - {}", error);
            }
            config.toml.ensure_valid()?;
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("cascade.toml already exists at {}", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.state_dir)
                .with_context(|| format!("Failed to create {}", config.state_dir.display()))?;
            CascadeToml::default().save(&config_path)?;

            println!("Created cascade.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [executor] command, timeout_secs");
            println!("  - [pipeline] threshold, max_parallel");
            println!("  - [stages.<name>] tokens, artifact, mode, instructions");
            println!();
        }
    }

    Ok(())
}
