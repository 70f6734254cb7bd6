//! Per-stage state machine driver.
//!
//! One iteration: select an item, check its upstream dependency, invoke the
//! executor, interpret the sentinel signal, verify completion claims against
//! the artifacts (with at most one corrective retry) and store the result.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Engine;
use super::retry::{RetryCoordinator, RetryResult};
use crate::errors::CascadeError;
use crate::executor::{ContextPacket, ExecutionOutcome, ExecutionRequest, Signal, StageRun};
use crate::reconcile;
use crate::registry::{BlockClassification, ItemStatus, WorkItem};
use crate::stage::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    NoWork,
    Completed { count: u64 },
    Blocked,
    DependencyMissing,
    /// Neither token in the transcript
    Ambiguous,
    RetryRecovered { count: u64 },
    ValidationFailed { error: String },
}

impl IterationOutcome {
    pub fn is_terminal_block(&self) -> bool {
        matches!(
            self,
            IterationOutcome::Blocked | IterationOutcome::DependencyMissing
        )
    }
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub item_id: Option<String>,
    pub stage: Stage,
    pub outcome: IterationOutcome,
    pub duration: Duration,
}

/// Fresh counters for one stage plus the artifact count of every stage.
struct Counts {
    discovered: u64,
    produced: u64,
    failed: u64,
    blocked: u64,
    by_stage: BTreeMap<Stage, u64>,
}

#[derive(Clone)]
pub struct StageController {
    engine: Arc<Engine>,
    stage: Stage,
    retry: RetryCoordinator,
    item_filter: Option<String>,
}

impl StageController {
    pub fn new(engine: Arc<Engine>, stage: Stage) -> Self {
        let retry = RetryCoordinator::new(engine.validator.clone());
        Self {
            engine,
            stage,
            retry,
            item_filter: None,
        }
    }

    /// Restrict selection to a single item.
    pub fn with_item_filter(mut self, item_id: impl Into<String>) -> Self {
        self.item_filter = Some(item_id.into());
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn run_once(&self) -> Result<IterationReport> {
        let start = Instant::now();
        let Some(item) = self.select()? else {
            return Ok(IterationReport {
                item_id: None,
                stage: self.stage,
                outcome: IterationOutcome::NoWork,
                duration: start.elapsed(),
            });
        };

        let item_id = item.id.clone();
        let outcome = self.process(item).await?;
        tracing::info!(item = %item_id, stage = %self.stage, outcome = ?outcome, "Iteration finished");
        Ok(IterationReport {
            item_id: Some(item_id),
            stage: self.stage,
            outcome,
            duration: start.elapsed(),
        })
    }

    /// Resume an item already in progress for this stage, else take the
    /// highest-priority pending item whose upstream has produced something.
    pub fn select(&self) -> Result<Option<WorkItem>> {
        let candidates: Vec<WorkItem> = self
            .engine
            .registry
            .list_selectable(self.stage)?
            .into_iter()
            .filter(|i| self.item_filter.as_ref().is_none_or(|id| *id == i.id))
            .collect();

        if let Some(item) = candidates
            .iter()
            .find(|i| i.stage(self.stage).status == ItemStatus::InProgress)
        {
            return Ok(Some(item.clone()));
        }

        for item in candidates {
            if self.upstream_ready(&item)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn upstream_ready(&self, item: &WorkItem) -> Result<bool> {
        let Some(upstream) = self.stage.upstream() else {
            return Ok(true);
        };
        let progress = item.stage(upstream);
        // A verified but empty upstream is selected so the dependency check marks it
        if progress.produced > 0 || progress.is_verified() {
            return Ok(true);
        }
        Ok(self.engine.validator.count(item, upstream)? > 0)
    }

    async fn process(&self, item: WorkItem) -> Result<IterationOutcome> {
        let stage = self.stage;

        if let Some(upstream) = stage.upstream()
            && self.engine.validator.count(&item, upstream)? == 0
        {
            let err = CascadeError::DependencyMissing {
                item_id: item.id.clone(),
                stage,
                path: self
                    .engine
                    .catalog
                    .get(upstream)
                    .artifact_path(&item.output_dir),
            };
            tracing::warn!(item = %item.id, stage = %stage, "{}", err);
            self.engine.registry.update(&item.id, |i| {
                i.stage_mut(stage).last_error = Some(err.to_string());
                i.record_block(stage, BlockClassification::DependencyMissing);
            })?;
            return Ok(IterationOutcome::DependencyMissing);
        }

        let claimed = self.engine.registry.update(&item.id, |i| {
            let p = i.stage_mut(stage);
            p.status = ItemStatus::InProgress;
            p.attempts += 1;
            mark_in_progress(i);
        })?;
        let attempt = claimed.stage(stage).attempts;

        let request = self.build_request(&claimed, attempt, None)?;
        let outcome = self.invoke(&request).await?;

        match outcome.signal {
            Signal::Blocked => {
                self.apply_block(&claimed)?;
                Ok(IterationOutcome::Blocked)
            }
            Signal::None => {
                let counts = self.counts(&claimed)?;
                let note = if outcome.timed_out {
                    "executor timed out without a sentinel token"
                } else {
                    "no sentinel token in executor output"
                };
                self.engine.registry.update(&claimed.id, |i| {
                    let p = i.stage_mut(stage);
                    p.set_counts(counts.discovered, counts.produced, counts.failed, counts.blocked);
                    p.last_error = Some(note.to_string());
                    mark_in_progress(i);
                })?;
                tracing::warn!(item = %claimed.id, stage = %stage, "{}", note);
                Ok(IterationOutcome::Ambiguous)
            }
            Signal::Completed => {
                let report = self.engine.validator.validate(&claimed, stage)?;
                if report.valid {
                    self.apply_completion(&claimed)?;
                    return Ok(IterationOutcome::Completed {
                        count: report.count,
                    });
                }
                self.retry_claim(&claimed, attempt, &report).await
            }
        }
    }

    async fn retry_claim(
        &self,
        item: &WorkItem,
        attempt: u32,
        failure: &crate::validator::ValidationReport,
    ) -> Result<IterationOutcome> {
        let stage = self.stage;
        let spec = self.engine.catalog.get(stage);
        let artifact = spec.artifact_path(&item.output_dir);
        let directive =
            RetryCoordinator::directive(spec, failure, &artifact.display().to_string());

        let claimed = self.engine.registry.update(&item.id, |i| {
            i.stage_mut(stage).attempts += 1;
        })?;
        let corrected = self.build_request(&claimed, attempt + 1, Some(directive))?;
        let executor = self.engine.executors.for_stage(stage);

        self.start_ui(&corrected);
        let started_at = Utc::now();
        let result = self.retry.retry(executor.as_ref(), &corrected, &claimed).await;
        self.finish_ui(&corrected, result.as_ref().ok().map(|(_, o)| o));
        let (result, outcome) = result?;
        self.log_run(&corrected, started_at, &outcome);

        match result {
            RetryResult::Blocked => {
                self.apply_block(&claimed)?;
                Ok(IterationOutcome::Blocked)
            }
            RetryResult::Recovered(report) => {
                self.apply_completion(&claimed)?;
                Ok(IterationOutcome::RetryRecovered {
                    count: report.count,
                })
            }
            RetryResult::StillInvalid(report) => {
                let error = report
                    .error
                    .unwrap_or_else(|| "output could not be verified".to_string());
                let counts = self.counts(&claimed)?;
                self.engine.registry.update(&claimed.id, |i| {
                    let p = i.stage_mut(stage);
                    p.set_counts(counts.discovered, counts.produced, counts.failed, counts.blocked);
                    p.status = ItemStatus::InProgress;
                    p.last_error = Some(error.clone());
                    mark_in_progress(i);
                })?;
                tracing::warn!(
                    item = %claimed.id,
                    stage = %stage,
                    error = %error,
                    "Output still invalid after corrective retry"
                );
                Ok(IterationOutcome::ValidationFailed { error })
            }
        }
    }

    /// Clear the verified mark when the upstream artifact grew past what this
    /// stage last saw, so the stage runs again over the new units.
    pub fn reopen_if_upstream_grew(&self, item: &WorkItem) -> Result<bool> {
        let Some(upstream) = self.stage.upstream() else {
            return Ok(false);
        };
        let progress = item.stage(self.stage);
        if !progress.is_verified() || item.status.is_sticky() {
            return Ok(false);
        }
        let upstream_count = self.engine.validator.count(item, upstream)?;
        if upstream_count <= progress.discovered {
            return Ok(false);
        }
        let stage = self.stage;
        self.engine.registry.update(&item.id, |i| {
            let p = i.stage_mut(stage);
            p.verified_at = None;
            p.status = ItemStatus::InProgress;
        })?;
        tracing::info!(
            item = %item.id,
            stage = %stage,
            upstream_count,
            seen = progress.discovered,
            "Upstream grew, reopening stage"
        );
        Ok(true)
    }

    fn build_request(
        &self,
        item: &WorkItem,
        attempt: u32,
        directive: Option<String>,
    ) -> Result<ExecutionRequest> {
        let stage = self.stage;
        let spec = self.engine.catalog.get(stage);
        let context = ContextPacket {
            item_id: item.id.clone(),
            name: item.name.clone(),
            url: item.url.clone(),
            stage,
            output_dir: item.output_dir.clone(),
            artifact_path: spec.artifact_path(&item.output_dir),
            upstream_artifact_path: stage
                .upstream()
                .map(|up| self.engine.catalog.get(up).artifact_path(&item.output_dir)),
            checkpoint_path: stage
                .resumable()
                .then(|| self.engine.checkpoints.path_for(&item.id, stage)),
            counters: item.stage(stage),
            attempt,
            directive,
        };
        let instructions = self.engine.prompts.render(spec, &context)?;
        Ok(ExecutionRequest {
            item_id: item.id.clone(),
            stage,
            attempt,
            instructions,
            context,
            done_token: spec.done_token.clone(),
            blocked_token: spec.blocked_token.clone(),
        })
    }

    async fn invoke(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let executor = self.engine.executors.for_stage(self.stage);
        self.start_ui(request);
        let started_at = Utc::now();
        let outcome = executor.execute(request).await;
        self.finish_ui(request, outcome.as_ref().ok());
        let outcome = outcome?;
        self.log_run(request, started_at, &outcome);
        Ok(outcome)
    }

    fn start_ui(&self, request: &ExecutionRequest) {
        if let Some(ui) = &self.engine.ui {
            ui.start_invocation(&request.item_id, request.stage, request.attempt);
        }
    }

    fn finish_ui(&self, request: &ExecutionRequest, outcome: Option<&ExecutionOutcome>) {
        if let Some(ui) = &self.engine.ui {
            ui.finish_invocation(&request.item_id, request.stage, outcome);
        }
    }

    fn log_run(
        &self,
        request: &ExecutionRequest,
        started_at: chrono::DateTime<Utc>,
        outcome: &ExecutionOutcome,
    ) {
        StageRun {
            item_id: &request.item_id,
            stage: request.stage,
            attempt: request.attempt,
            started_at,
            outcome,
        }
        .log();
    }

    /// Derive counters from disk. Runs before the registry lock is taken.
    fn counts(&self, item: &WorkItem) -> Result<Counts> {
        let stage = self.stage;
        let mut by_stage = BTreeMap::new();
        for s in Stage::ALL {
            by_stage.insert(s, self.engine.validator.count(item, s)?);
        }
        let produced = by_stage.get(&stage).copied().unwrap_or(0);
        let discovered = match stage.upstream() {
            Some(up) => by_stage.get(&up).copied().unwrap_or(0),
            None => produced,
        };
        let (failed, blocked) = if stage.resumable() {
            let counts = self.engine.checkpoints.load(&item.id, stage)?.counts();
            (counts.failed, counts.blocked)
        } else {
            (0, 0)
        };
        Ok(Counts {
            discovered,
            produced,
            failed,
            blocked,
            by_stage,
        })
    }

    /// Single registry update for a verified completion claim.
    fn apply_completion(&self, item: &WorkItem) -> Result<WorkItem> {
        let stage = self.stage;
        let counts = self.counts(item)?;
        let by_stage = counts.by_stage.clone();
        // The claim closes the stage: upstream units with no output are failures
        let unaccounted = counts
            .discovered
            .saturating_sub(counts.produced + counts.failed + counts.blocked);
        let updated = self.engine.registry.update(&item.id, |i| {
            let p = i.stage_mut(stage);
            p.set_counts(
                counts.discovered,
                counts.produced,
                counts.failed + unaccounted,
                counts.blocked,
            );
            p.verified_at = Some(Utc::now());
            p.last_error = None;
            reconcile::refresh(i, |s| by_stage.get(&s).copied().unwrap_or(0));
        })?;
        tracing::info!(
            item = %item.id,
            stage = %stage,
            count = counts.produced,
            status = %updated.status,
            "Stage output verified"
        );
        Ok(updated)
    }

    fn apply_block(&self, item: &WorkItem) -> Result<WorkItem> {
        let stage = self.stage;
        let counts = self.counts(item)?;
        let updated = self.engine.registry.update(&item.id, |i| {
            i.stage_mut(stage).set_counts(
                counts.discovered,
                counts.produced,
                counts.failed,
                counts.blocked,
            );
            i.record_block(stage, BlockClassification::AntiBot);
        })?;
        tracing::warn!(
            item = %item.id,
            stage = %stage,
            count_at_block = counts.produced,
            "Item permanently blocked"
        );
        Ok(updated)
    }
}

/// Work has started on the item unless an operator parked it.
fn mark_in_progress(item: &mut WorkItem) {
    if !item.status.is_sticky() {
        item.status = ItemStatus::InProgress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedExecutor;
    use crate::orchestrator::test_support::{add_item, engine, write_lines};
    use tempfile::tempdir;

    fn artifact(req: &ExecutionRequest) -> std::path::PathBuf {
        req.context.artifact_path.clone()
    }

    #[tokio::test]
    async fn test_verified_completion_updates_counters() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new().then(|req| {
            write_lines(&artifact(req), 3);
            "found 3 urls\nDISCOVERY_DONE".into()
        }));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        let report = controller.run_once().await.unwrap();
        assert_eq!(report.outcome, IterationOutcome::Completed { count: 3 });

        let item = engine.registry.get("acme").unwrap();
        let p = item.stage(Stage::Discovery);
        assert!(p.is_verified());
        assert_eq!((p.discovered, p.produced, p.attempts), (3, 3, 1));
        // Nothing downstream yet
        assert_eq!(p.status, ItemStatus::InProgress);
        assert_eq!(item.status, ItemStatus::InProgress);

        let again = controller.run_once().await.unwrap();
        assert_eq!(again.outcome, IterationOutcome::NoWork);
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_blocked_token_is_terminal() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::always("captcha everywhere\nDISCOVERY_BLOCKED"));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        assert_eq!(
            controller.run_once().await.unwrap().outcome,
            IterationOutcome::Blocked
        );

        let item = engine.registry.get("acme").unwrap();
        assert_eq!(item.status, ItemStatus::Blocked);
        assert_eq!(item.block_events.len(), 1);
        assert_eq!(
            item.block_events[0].classification,
            BlockClassification::AntiBot
        );

        for _ in 0..3 {
            assert_eq!(
                controller.run_once().await.unwrap().outcome,
                IterationOutcome::NoWork
            );
        }
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_upstream_blocks_without_invoking() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::always("RETRIEVAL_DONE"));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);
        // Discovery verified but its artifact is empty
        engine
            .registry
            .update("acme", |i| {
                i.stage_mut(Stage::Discovery).verified_at = Some(Utc::now());
            })
            .unwrap();

        let controller = StageController::new(engine.clone(), Stage::Retrieval);
        assert_eq!(
            controller.run_once().await.unwrap().outcome,
            IterationOutcome::DependencyMissing
        );
        assert_eq!(exec.calls(), 0);

        let item = engine.registry.get("acme").unwrap();
        assert_eq!(item.status, ItemStatus::Blocked);
        assert_eq!(
            item.block_events[0].classification,
            BlockClassification::DependencyMissing
        );
        assert!(item.invariant_violations(|_| 0).is_empty());
    }

    #[tokio::test]
    async fn test_unstarted_upstream_is_not_selected() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::always("RETRIEVAL_DONE"));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Retrieval);
        assert!(controller.select().unwrap().is_none());
        assert_eq!(engine.registry.get("acme").unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_false_completion_gets_exactly_one_retry() {
        let dir = tempdir().unwrap();
        // Claims completion every time, never writes anything
        let exec = Arc::new(ScriptedExecutor::always("all done! DISCOVERY_DONE"));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        let report = controller.run_once().await.unwrap();
        let IterationOutcome::ValidationFailed { error } = report.outcome else {
            panic!("expected validation failure, got {:?}", report.outcome);
        };
        assert!(error.starts_with("artifact missing"));
        assert_eq!(exec.calls(), 2);

        let requests = exec.requests();
        assert!(requests[0].context.directive.is_none());
        let directive = requests[1].context.directive.as_deref().unwrap();
        assert!(directive.contains("artifact missing"));
        assert!(requests[1].instructions.starts_with("## CORRECTIVE DIRECTIVE"));

        let item = engine.registry.get("acme").unwrap();
        let p = item.stage(Stage::Discovery);
        assert_eq!(p.status, ItemStatus::InProgress);
        assert!(!p.is_verified());
        assert_eq!(p.last_error.as_deref(), Some(error.as_str()));
        assert_eq!(item.status, ItemStatus::InProgress);
        assert!(item.invariant_violations(|_| 0).is_empty());
    }

    #[tokio::test]
    async fn test_zero_records_then_recovery() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .then(|req| {
                    write_lines(&artifact(req), 0);
                    "DISCOVERY_DONE".into()
                })
                .then(|req| {
                    write_lines(&artifact(req), 2);
                    "fixed it DISCOVERY_DONE".into()
                }),
        );
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        let report = controller.run_once().await.unwrap();
        assert_eq!(report.outcome, IterationOutcome::RetryRecovered { count: 2 });
        assert!(
            exec.requests()[1]
                .context
                .directive
                .as_deref()
                .unwrap()
                .contains("0 records found")
        );
        assert!(engine.registry.get("acme").unwrap().stage(Stage::Discovery).is_verified());
    }

    #[tokio::test]
    async fn test_retry_answering_blocked_blocks_item() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .then(|_| "DISCOVERY_DONE".into())
                .then(|_| "DISCOVERY_BLOCKED".into()),
        );
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "acme", 100);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        assert_eq!(
            controller.run_once().await.unwrap().outcome,
            IterationOutcome::Blocked
        );
        assert_eq!(exec.calls(), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_run_is_resumed_first() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::always("still thinking..."));
        let engine = engine(dir.path(), exec.clone());
        add_item(&engine, dir.path(), "late", 500);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        assert_eq!(
            controller.run_once().await.unwrap().outcome,
            IterationOutcome::Ambiguous
        );
        let late = engine.registry.get("late").unwrap();
        assert_eq!(late.status, ItemStatus::InProgress);
        let p = late.stage(Stage::Discovery);
        assert_eq!(p.status, ItemStatus::InProgress);
        assert_eq!(p.attempts, 1);
        assert!(p.last_error.is_some());

        // A higher-priority newcomer waits behind the in-progress item
        add_item(&engine, dir.path(), "early", 1);
        let next = controller.select().unwrap().unwrap();
        assert_eq!(next.id, "late");
    }

    #[tokio::test]
    async fn test_pending_items_by_priority_then_id() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), Arc::new(ScriptedExecutor::new()));
        add_item(&engine, dir.path(), "b", 10);
        add_item(&engine, dir.path(), "a", 10);
        add_item(&engine, dir.path(), "c", 5);

        let controller = StageController::new(engine.clone(), Stage::Discovery);
        assert_eq!(controller.select().unwrap().unwrap().id, "c");
        let only_b = controller.clone().with_item_filter("b");
        assert_eq!(only_b.select().unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_reopen_when_upstream_grows() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::always("EXTRACTION_DONE"));
        let engine = engine(dir.path(), exec);
        let item = add_item(&engine, dir.path(), "acme", 100);
        crate::orchestrator::test_support::write_pages(&item.output_dir.join("html"), 2);
        engine
            .registry
            .update("acme", |i| {
                let p = i.stage_mut(Stage::Extraction);
                p.set_counts(2, 2, 0, 0);
                p.verified_at = Some(Utc::now());
            })
            .unwrap();

        let controller = StageController::new(engine.clone(), Stage::Extraction);
        let item = engine.registry.get("acme").unwrap();
        assert!(!controller.reopen_if_upstream_grew(&item).unwrap());

        crate::orchestrator::test_support::write_pages(&item.output_dir.join("html"), 3);
        assert!(controller.reopen_if_upstream_grew(&item).unwrap());
        let p = engine.registry.get("acme").unwrap().stage(Stage::Extraction);
        assert!(!p.is_verified());
        assert_eq!(p.status, ItemStatus::InProgress);
    }
}
