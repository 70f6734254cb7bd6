//! Cascade mode: every stage of an item gets its own worker, and a
//! downstream worker starts as soon as its threshold trigger fires.
//!
//! Triggers are evaluated on a fixed poll (artifact growth) and on every
//! worker exit, so a finishing upstream releases its downstream immediately.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::trigger::{StartReason, ThresholdTrigger, TriggerDecision, UpstreamObservation};
use crate::orchestrator::{Engine, IterationOutcome, StageController};
use crate::registry::{ItemStatus, sort_by_priority};
use crate::stage::Stage;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upstream units needed before a downstream stage starts
    pub threshold: u64,
    pub poll_interval: Duration,
    pub max_iterations_per_stage: u32,
    /// Items supervised concurrently by `run_all`
    pub max_parallel: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threshold: 20,
            poll_interval: Duration::from_secs(5),
            max_iterations_per_stage: 50,
            max_parallel: 2,
        }
    }
}

/// Why a stage worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// Verified (or nothing left to do) with no upstream still running
    Finished,
    Blocked,
    Cancelled,
    /// Hit the per-stage iteration cap
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStart {
    pub stage: Stage,
    /// `None` for the first stage, which starts unconditionally
    pub reason: Option<StartReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub item_id: String,
    pub started: Vec<StageStart>,
    pub exits: BTreeMap<Stage, WorkerExit>,
    pub iterations: u32,
    pub status: ItemStatus,
    pub interrupted: bool,
    pub elapsed: Duration,
}

type WorkerResult = (Stage, Result<(WorkerExit, u32)>);

#[derive(Clone)]
pub struct PipelineSupervisor {
    engine: Arc<Engine>,
    settings: PipelineSettings,
}

impl PipelineSupervisor {
    pub fn new(engine: Arc<Engine>, settings: PipelineSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Drive one item through every remaining stage.
    pub async fn run_item(&self, item_id: &str, cancel: CancellationToken) -> Result<PipelineReport> {
        let start = Instant::now();
        let item = self.engine.registry.get(item_id)?;
        let mut report = PipelineReport {
            item_id: item_id.to_string(),
            started: Vec::new(),
            exits: BTreeMap::new(),
            iterations: 0,
            status: item.status,
            interrupted: false,
            elapsed: Duration::ZERO,
        };

        let first = Stage::ALL
            .into_iter()
            .find(|s| !item.stage(*s).is_verified());
        let Some(first) = first.filter(|_| item.status.is_selectable()) else {
            tracing::info!(item = %item_id, status = %item.status, "Nothing to run for item");
            return Ok(report);
        };
        let stages = &Stage::ALL[first.index()..];

        let child = cancel.child_token();
        let alive: BTreeMap<Stage, watch::Sender<bool>> = stages
            .iter()
            .map(|s| (*s, watch::channel(false).0))
            .collect();
        let mut triggers: BTreeMap<Stage, ThresholdTrigger> = stages[1..]
            .iter()
            .map(|s| (*s, ThresholdTrigger::new(self.settings.threshold)))
            .collect();
        let mut spawned: BTreeSet<Stage> = BTreeSet::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        self.spawn_worker(&mut workers, &alive, item_id, first, &child);
        spawned.insert(first);
        report.started.push(StageStart {
            stage: first,
            reason: None,
        });
        self.announce_start(item_id, first, None);

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut blocked = false;
        let mut failure: Option<anyhow::Error> = None;

        loop {
            if !blocked && !child.is_cancelled() {
                let item = self.engine.registry.get(item_id)?;
                if item.status == ItemStatus::Blocked {
                    blocked = true;
                } else {
                    for (stage, trigger) in triggers.iter_mut() {
                        if spawned.contains(stage) {
                            continue;
                        }
                        let Some(upstream) = stage.upstream().filter(|u| spawned.contains(u))
                        else {
                            continue;
                        };
                        let observation = UpstreamObservation {
                            produced: self.engine.validator.count(&item, upstream)?,
                            worker_running: alive.get(&upstream).is_some_and(|tx| *tx.borrow()),
                        };
                        if let TriggerDecision::Start(reason) = trigger.observe(observation) {
                            self.spawn_worker(&mut workers, &alive, item_id, *stage, &child);
                            spawned.insert(*stage);
                            report.started.push(StageStart {
                                stage: *stage,
                                reason: Some(reason),
                            });
                            self.announce_start(item_id, *stage, Some(reason));
                            tracing::debug!(
                                item = %item_id,
                                stage = %stage,
                                upstream_count = observation.produced,
                                "Trigger fired"
                            );
                        }
                    }
                }
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !report.interrupted => {
                    report.interrupted = true;
                    child.cancel();
                    tracing::warn!(item = %item_id, "Pipeline interrupted, stopping workers");
                }
                joined = workers.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((stage, Ok((exit, iterations)))) => {
                            if let Some(tx) = alive.get(&stage) {
                                tx.send_replace(false);
                            }
                            report.exits.insert(stage, exit);
                            report.iterations += iterations;
                            if exit == WorkerExit::Blocked {
                                blocked = true;
                            }
                            if let Some(ui) = &self.engine.ui {
                                ui.stage_exited(item_id, stage, exit);
                            }
                            tracing::info!(item = %item_id, stage = %stage, exit = ?exit, iterations, "Stage worker exited");
                        }
                        Ok((stage, Err(e))) => {
                            if let Some(tx) = alive.get(&stage) {
                                tx.send_replace(false);
                            }
                            tracing::error!(item = %item_id, stage = %stage, error = %e, "Stage worker failed");
                            failure.get_or_insert(e);
                            child.cancel();
                        }
                        Err(e) => {
                            failure.get_or_insert(anyhow::Error::new(e).context("Stage worker panicked"));
                            child.cancel();
                        }
                    }
                }
                _ = ticker.tick() => {}
            }
        }

        if let Some(e) = failure {
            return Err(e.context(format!("Pipeline for {} failed", item_id)));
        }
        report.status = self.engine.registry.get(item_id)?.status;
        report.elapsed = start.elapsed();
        Ok(report)
    }

    /// Supervise every selectable item, `max_parallel` at a time, in
    /// priority order.
    pub async fn run_all(&self, cancel: CancellationToken) -> Result<Vec<PipelineReport>> {
        let mut items: Vec<_> = self
            .engine
            .registry
            .list()?
            .into_iter()
            .filter(|i| i.status.is_selectable())
            .collect();
        sort_by_priority(&mut items);
        tracing::info!(items = items.len(), lanes = self.settings.max_parallel, "Starting pipelines");

        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.send(item.id).await.context("Work queue closed")?;
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let child = cancel.child_token();
        let mut lanes = JoinSet::new();
        for _ in 0..self.settings.max_parallel.max(1) {
            let supervisor = self.clone();
            let rx = rx.clone();
            let cancel = child.clone();
            lanes.spawn(async move {
                let mut reports = Vec::new();
                while !cancel.is_cancelled() {
                    let next = rx.lock().await.recv().await;
                    let Some(id) = next else { break };
                    reports.push(supervisor.run_item(&id, cancel.clone()).await?);
                }
                Ok::<_, anyhow::Error>(reports)
            });
        }

        let mut reports = Vec::new();
        let mut failure: Option<anyhow::Error> = None;
        while let Some(joined) = lanes.join_next().await {
            match joined.context("Pipeline lane panicked").and_then(|r| r) {
                Ok(lane) => reports.extend(lane),
                Err(e) => {
                    child.cancel();
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<WorkerResult>,
        alive: &BTreeMap<Stage, watch::Sender<bool>>,
        item_id: &str,
        stage: Stage,
        cancel: &CancellationToken,
    ) {
        if let Some(tx) = alive.get(&stage) {
            tx.send_replace(true);
        }
        let upstream_alive = stage
            .upstream()
            .and_then(|u| alive.get(&u))
            .map(|tx| tx.subscribe());
        let worker = StageWorker {
            engine: self.engine.clone(),
            controller: StageController::new(self.engine.clone(), stage).with_item_filter(item_id),
            item_id: item_id.to_string(),
            upstream_alive,
            max_iterations: self.settings.max_iterations_per_stage,
            poll_interval: self.settings.poll_interval,
            cancel: cancel.clone(),
        };
        workers.spawn(async move { (stage, worker.run().await) });
    }

    fn announce_start(&self, item_id: &str, stage: Stage, reason: Option<StartReason>) {
        tracing::info!(item = %item_id, stage = %stage, reason = ?reason, "Starting stage worker");
        if let Some(ui) = &self.engine.ui {
            ui.stage_started(item_id, stage, reason);
        }
    }
}

/// A stage controller loop restricted to one item.
struct StageWorker {
    engine: Arc<Engine>,
    controller: StageController,
    item_id: String,
    upstream_alive: Option<watch::Receiver<bool>>,
    max_iterations: u32,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl StageWorker {
    async fn run(mut self) -> Result<(WorkerExit, u32)> {
        let stage = self.controller.stage();
        let mut iterations = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok((WorkerExit::Cancelled, iterations));
            }
            let item = self.engine.registry.get(&self.item_id)?;
            match item.status {
                ItemStatus::Blocked => return Ok((WorkerExit::Blocked, iterations)),
                ItemStatus::Completed | ItemStatus::Skip => {
                    return Ok((WorkerExit::Finished, iterations));
                }
                ItemStatus::Pending | ItemStatus::InProgress => {}
            }

            if item.stage(stage).is_verified() {
                if self.controller.reopen_if_upstream_grew(&item)? {
                    continue;
                }
                if !self.upstream_running() {
                    return Ok((WorkerExit::Finished, iterations));
                }
                if self.wait_for_upstream().await {
                    return Ok((WorkerExit::Cancelled, iterations));
                }
                continue;
            }

            if iterations >= self.max_iterations {
                tracing::warn!(item = %self.item_id, stage = %stage, iterations, "Stage iteration cap reached");
                return Ok((WorkerExit::Exhausted, iterations));
            }

            let report = tokio::select! {
                _ = self.cancel.cancelled() => return Ok((WorkerExit::Cancelled, iterations)),
                report = self.controller.run_once() => report?,
            };
            match report.outcome {
                IterationOutcome::NoWork => {
                    if !self.upstream_running() {
                        return Ok((WorkerExit::Finished, iterations));
                    }
                    if self.wait_for_upstream().await {
                        return Ok((WorkerExit::Cancelled, iterations));
                    }
                }
                ref outcome => {
                    iterations += 1;
                    if let Some(ui) = &self.engine.ui {
                        ui.iteration(iterations, self.max_iterations, &report);
                    }
                    if outcome.is_terminal_block() {
                        return Ok((WorkerExit::Blocked, iterations));
                    }
                }
            }
        }
    }

    fn upstream_running(&self) -> bool {
        self.upstream_alive.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep until the next poll, an upstream exit, or cancellation.
    /// Returns true when cancelled.
    async fn wait_for_upstream(&mut self) -> bool {
        let poll = tokio::time::sleep(self.poll_interval);
        match self.upstream_alive.as_mut() {
            Some(rx) => tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = poll => false,
                _ = rx.changed() => false,
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = poll => false,
            },
        }
    }
}
