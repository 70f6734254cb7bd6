use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use cascade::config::Config;
use cascade::errors::exit_code_for;
use cascade::logging::{self, LogFormat};

mod cmd;

/// Conventional exit status after Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version, about = "Drive an LLM executor through a verified multi-stage scraping pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Registry document (default: <project>/sources.json)
    #[arg(long, global = true)]
    pub registry: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run stage controllers (sequential by default, cascade with --pipeline)
    Run(RunArgs),
    /// Show every item with per-stage counters
    Status {
        /// Print the registry items as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare recorded statuses against the artifacts on disk
    Audit {
        /// Write corrected statuses back to the registry
        #[arg(long)]
        fix: bool,
    },
    /// Register a new work item
    Add {
        id: String,
        url: String,
        #[arg(long)]
        name: Option<String>,
        /// Lower runs first
        #[arg(long, default_value_t = 100)]
        priority: i64,
        /// Default: <project>/output/<id>
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Return a blocked item to pending
    Unblock {
        id: String,
        /// Also delete its sub-unit checkpoints
        #[arg(long)]
        reset_checkpoint: bool,
    },
    /// Park an item so it is never selected
    Skip { id: String },
    /// Move completed items to the archive document
    Archive,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone)]
pub struct RunArgs {
    /// Iteration budget for sequential mode
    #[arg(default_value_t = 50)]
    pub max_iterations: u32,

    /// Cascade mode for one item
    #[arg(long, value_name = "ITEM_ID", conflicts_with = "pipeline_all")]
    pub pipeline: Option<String>,

    /// Cascade mode for every selectable item
    #[arg(long)]
    pub pipeline_all: bool,

    /// Upstream units before a downstream stage starts
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Items supervised at once with --pipeline-all
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Executor command (overrides cascade.toml and CASCADE_EXECUTOR_CMD)
    #[arg(long)]
    pub executor: Option<String>,

    /// Per-invocation timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report problems
    Validate,
    /// Write a default cascade.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Fatal error");
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::from(exit_code_for(&e) as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.registry.clone(), cli.verbose)?;
    let _log_guard = logging::init(cli.verbose, cli.log_format, Some(&config.log_dir))?;

    match &cli.command {
        Commands::Run(args) => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping workers");
                    on_signal.cancel();
                }
            });
            let interrupted = cmd::cmd_run(config, args.clone(), cancel).await?;
            if interrupted {
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
        Commands::Status { json } => cmd::cmd_status(&config, *json)?,
        Commands::Audit { fix } => cmd::cmd_audit(&config, *fix)?,
        Commands::Add {
            id,
            url,
            name,
            priority,
            output_dir,
        } => cmd::cmd_add(&config, id, url, name.as_deref(), *priority, output_dir.as_deref())?,
        Commands::Unblock {
            id,
            reset_checkpoint,
        } => cmd::cmd_unblock(&config, id, *reset_checkpoint)?,
        Commands::Skip { id } => cmd::cmd_skip(&config, id)?,
        Commands::Archive => cmd::cmd_archive(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
