//! Claude CLI executor.
//!
//! Spawns `<command> <flags>`, writes the prompt to stdin, folds the
//! stream-json output into a transcript and scans it for the stage tokens.
//! The child is killed when the timeout expires or the future is dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::stream::Transcript;
use super::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::errors::CascadeError;
use crate::ui::RunUI;
use crate::util::path_component;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub command: String,
    pub flags: Vec<String>,
    pub timeout: Duration,
    pub working_dir: PathBuf,
    /// Prompt and transcript files go here when set
    pub log_dir: Option<PathBuf>,
}

pub struct ClaudeExecutor {
    settings: ExecutorSettings,
    ui: Option<Arc<RunUI>>,
}

impl ClaudeExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings, ui: None }
    }

    pub fn with_ui(mut self, ui: Arc<RunUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    fn log_file(&self, request: &ExecutionRequest, suffix: &str) -> Option<PathBuf> {
        let dir = self.settings.log_dir.as_ref()?;
        Some(dir.join(format!(
            "{}-{}-{}-attempt-{}-{}",
            path_component(&request.item_id),
            request.stage,
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            request.attempt,
            suffix
        )))
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let ctx = &request.context;
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.flags)
            .current_dir(&self.settings.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CASCADE_ITEM_ID", &request.item_id)
            .env("CASCADE_STAGE", request.stage.as_str())
            .env("CASCADE_ATTEMPT", request.attempt.to_string())
            .env("CASCADE_OUTPUT_DIR", &ctx.output_dir)
            .env("CASCADE_ARTIFACT_PATH", &ctx.artifact_path)
            .env(
                "CASCADE_UPSTREAM_PATH",
                ctx.upstream_artifact_path.clone().unwrap_or_default(),
            )
            .env(
                "CASCADE_CHECKPOINT_PATH",
                ctx.checkpoint_path.clone().unwrap_or_default(),
            );
        cmd
    }
}

#[async_trait]
impl TaskExecutor for ClaudeExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let start = Instant::now();

        if let Some(prompt_file) = self.log_file(request, "prompt.md") {
            if let Some(dir) = prompt_file.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            std::fs::write(&prompt_file, &request.instructions)
                .context("Failed to write prompt file")?;
        }

        let mut child = match self.build_command(request).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CascadeError::ExecutorMissing {
                    command: self.settings.command.clone(),
                    source: e,
                }
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to spawn executor '{}'", self.settings.command)
                });
            }
        };
        tracing::debug!(
            item = %request.item_id,
            stage = %request.stage,
            pid = child.id().unwrap_or(0),
            "Executor spawned"
        );

        // Fed concurrently so a child that never drains stdin still hits the timeout
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = request.instructions.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %e, "Executor did not consume the prompt");
                }
                let _ = stdin.shutdown().await;
            })
        });

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child.stdout.take().context("Failed to get executor stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = Transcript::default();
        let ui = self.ui.clone();

        let finished = tokio::time::timeout(self.settings.timeout, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(activity) = transcript.push_line(&line)
                    && let Some(ui) = &ui
                {
                    ui.show_activity(&request.item_id, request.stage, &activity);
                }
            }
            child.wait().await
        })
        .await;

        let (exit_code, timed_out) = match finished {
            Ok(status) => (status.context("Failed to wait for executor")?.code(), false),
            Err(_) => {
                tracing::warn!(
                    item = %request.item_id,
                    stage = %request.stage,
                    timeout_secs = self.settings.timeout.as_secs(),
                    "Executor timed out, killing it"
                );
                let _ = child.kill().await;
                (None, true)
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }

        let stderr = match stderr_task {
            // Grandchildren of a killed executor may still hold the pipe
            Some(task) if timed_out => {
                task.abort();
                String::new()
            }
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if transcript.is_error {
            tracing::warn!(item = %request.item_id, stage = %request.stage, "Executor reported an error");
        }

        let raw = transcript.into_text();
        if let Some(output_file) = self.log_file(request, "output.log") {
            let mut log = raw.clone();
            if !stderr.trim().is_empty() {
                log.push_str("\n--- stderr ---\n");
                log.push_str(&stderr);
            }
            std::fs::write(&output_file, log).context("Failed to write output file")?;
        }

        Ok(ExecutionOutcome::from_transcript(
            request,
            raw,
            exit_code,
            timed_out,
            start.elapsed(),
        ))
    }
}
