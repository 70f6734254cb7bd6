//! `cascade run`: sequential loop or cascade supervisor.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use cascade::checkpoint::CheckpointStore;
use cascade::config::Config;
use cascade::executor::ExecutorSet;
use cascade::executor::claude::ClaudeExecutor;
use cascade::orchestrator::{Engine, PromptBuilder, run_sequential};
use cascade::pipeline::PipelineSupervisor;
use cascade::registry::Registry;
use cascade::retrieval::HttpRetriever;
use cascade::stage::StageMode;
use cascade::ui::RunUI;
use cascade::validator::OutputValidator;

use super::super::RunArgs;

/// Build the shared collaborators for a run from the resolved configuration.
pub fn build_engine(config: &Config, ui: Option<Arc<RunUI>>) -> Result<Arc<Engine>> {
    let toml = &config.toml;
    toml.ensure_valid()?;
    let registry = Registry::open(&config.registry_path)?;
    config.ensure_directories()?;

    let catalog = Arc::new(toml.catalog()?);
    let validator = Arc::new(OutputValidator::new(
        catalog.clone(),
        Duration::from_secs(toml.validator.max_age_secs),
    ));
    let checkpoints = CheckpointStore::new(&config.checkpoint_dir);

    let claude = |stage| {
        let executor = ClaudeExecutor::new(toml.executor_settings(
            stage,
            &config.project_dir,
            &config.log_dir,
        ));
        match &ui {
            Some(ui) => executor.with_ui(ui.clone()),
            None => executor,
        }
    };

    let mut executors = ExecutorSet::new(Arc::new(claude(None)));
    for spec in catalog.iter() {
        if spec.mode == StageMode::Native {
            tracing::info!(stage = %spec.stage, "Using native HTTP retrieval");
            executors = executors.with_override(
                spec.stage,
                Arc::new(HttpRetriever::new(
                    toml.retrieval_settings(),
                    checkpoints.clone(),
                )),
            );
        } else if toml
            .stage_section(spec.stage)
            .is_some_and(|s| s.command.is_some())
        {
            executors = executors.with_override(spec.stage, Arc::new(claude(Some(spec.stage))));
        }
    }

    Ok(Arc::new(Engine {
        registry,
        catalog,
        validator,
        executors,
        checkpoints,
        prompts: PromptBuilder::new(&config.project_dir),
        ui,
    }))
}

/// Returns whether the run was interrupted.
pub async fn cmd_run(mut config: Config, args: RunArgs, cancel: CancellationToken) -> Result<bool> {
    if let Some(cmd) = args.executor {
        config.toml.executor.command = cmd;
    }
    if let Some(secs) = args.timeout_secs {
        config.toml.executor.timeout_secs = secs;
    }
    if let Some(threshold) = args.threshold {
        config.toml.pipeline.threshold = threshold;
    }
    if let Some(n) = args.max_parallel {
        config.toml.pipeline.max_parallel = n;
    }

    let ui = Arc::new(RunUI::new(config.verbose));
    let engine = build_engine(&config, Some(ui.clone()))?;
    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", %run_id);

    if args.pipeline.is_none() && !args.pipeline_all {
        tracing::info!(parent: &span, max_iterations = args.max_iterations, "Starting sequential run");
        let summary = run_sequential(engine, args.max_iterations, cancel)
            .instrument(span)
            .await?;
        ui.summary(&summary);
        return Ok(summary.interrupted);
    }

    let supervisor = PipelineSupervisor::new(engine.clone(), config.toml.pipeline_settings());
    let start = std::time::Instant::now();
    let reports = match &args.pipeline {
        Some(item_id) => {
            vec![
                supervisor
                    .run_item(item_id, cancel.clone())
                    .instrument(span)
                    .await?,
            ]
        }
        None => supervisor.run_all(cancel.clone()).instrument(span).await?,
    };
    ui.pipeline_reports(&reports);

    let interrupted = cancel.is_cancelled() || reports.iter().any(|r| r.interrupted);
    let iterations = reports.iter().map(|r| r.iterations).sum();
    let summary = cascade::orchestrator::SessionSummary::collect(
        &engine.registry,
        iterations,
        start.elapsed(),
        interrupted,
    )?;
    ui.summary(&summary);
    Ok(interrupted)
}
