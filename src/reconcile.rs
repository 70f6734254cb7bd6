//! Canonical status derivation and drift audit.
//!
//! `derive` is the single formula mapping counters to a status. Controllers
//! call it after every update; `audit` replays it over the whole registry to
//! find (and optionally fix) items whose recorded status drifted.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::registry::{BlockClassification, ItemStatus, Registry, StageProgress, WorkItem};
use crate::stage::Stage;
use crate::validator::OutputValidator;

/// Status implied by one stage's counters.
pub fn derive(
    discovered: u64,
    produced: u64,
    failed: u64,
    blocked: u64,
    downstream_present: bool,
) -> ItemStatus {
    let attempted = produced + failed + blocked;
    if discovered == 0 {
        ItemStatus::Pending
    } else if blocked > 0 {
        ItemStatus::Blocked
    } else if attempted < discovered {
        ItemStatus::InProgress
    } else if downstream_present {
        ItemStatus::Completed
    } else {
        ItemStatus::InProgress
    }
}

/// Derived status of one stage. The last stage has no consumer, so its own
/// verified output stands in for downstream presence.
pub fn derive_stage(
    stage: Stage,
    progress: &StageProgress,
    downstream_count: &impl Fn(Stage) -> u64,
) -> ItemStatus {
    if progress.status == ItemStatus::Blocked {
        return ItemStatus::Blocked;
    }
    // Claimed but nothing counted yet
    if progress.discovered == 0 && progress.attempts > 0 && !progress.is_verified() {
        return ItemStatus::InProgress;
    }
    let downstream_present = match stage.downstream() {
        Some(next) => downstream_count(next) > 0,
        None => progress.produced > 0 && progress.is_verified(),
    };
    derive(
        progress.discovered,
        progress.produced,
        progress.failed,
        progress.blocked,
        downstream_present,
    )
}

/// Combine per-stage statuses into the item status.
pub fn derive_item(item: &WorkItem, downstream_count: impl Fn(Stage) -> u64) -> ItemStatus {
    let statuses: Vec<ItemStatus> = Stage::ALL
        .iter()
        .map(|s| derive_stage(*s, &item.stage(*s), &downstream_count))
        .collect();

    if statuses.contains(&ItemStatus::Blocked) {
        ItemStatus::Blocked
    } else if statuses.iter().all(|s| *s == ItemStatus::Completed) {
        ItemStatus::Completed
    } else if statuses.iter().all(|s| *s == ItemStatus::Pending) {
        ItemStatus::Pending
    } else {
        ItemStatus::InProgress
    }
}

/// Status to store given what is recorded and what the counters imply.
/// Blocked and skip are only ever left by a manual action.
pub fn resolve(recorded: ItemStatus, derived: ItemStatus) -> ItemStatus {
    if recorded.is_sticky() {
        recorded
    } else {
        derived
    }
}

/// Re-derive stage and item statuses in place. Returns whether anything
/// changed. A newly derived block gets a `reconciled` block event.
pub fn refresh(item: &mut WorkItem, downstream_count: impl Fn(Stage) -> u64) -> bool {
    let mut changed = false;

    for stage in Stage::ALL {
        let Some(progress) = item.stages.get(&stage) else {
            continue;
        };
        let derived = derive_stage(stage, progress, &downstream_count);
        let next = resolve(progress.status, derived);
        if next != progress.status {
            if next == ItemStatus::Blocked {
                item.record_block(stage, BlockClassification::Reconciled);
            } else {
                item.stage_mut(stage).status = next;
            }
            changed = true;
        }
    }

    let derived = derive_item(item, &downstream_count);
    let next = resolve(item.status, derived);
    if next != item.status {
        if next == ItemStatus::Blocked && item.block_events.is_empty() {
            let stage = Stage::ALL
                .into_iter()
                .find(|s| item.stage(*s).status == ItemStatus::Blocked)
                .unwrap_or(Stage::Discovery);
            item.record_block(stage, BlockClassification::Reconciled);
        }
        item.status = next;
        changed = true;
    }

    changed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMismatch {
    pub item_id: String,
    pub recorded: ItemStatus,
    pub derived: ItemStatus,
    /// False for sticky statuses, which are reported but left alone
    pub fixable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub mismatches: Vec<StatusMismatch>,
    pub fixed: usize,
    pub invariant_violations: BTreeMap<String, Vec<String>>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.invariant_violations.is_empty()
    }
}

/// Artifact counts for every stage of every item, keyed by item id.
type CountTable = BTreeMap<String, BTreeMap<Stage, u64>>;

fn count_table(items: &[WorkItem], validator: &OutputValidator) -> Result<CountTable> {
    let mut table = CountTable::new();
    for item in items {
        let mut counts = BTreeMap::new();
        for stage in Stage::ALL {
            counts.insert(stage, validator.count(item, stage)?);
        }
        table.insert(item.id.clone(), counts);
    }
    Ok(table)
}

fn lookup(table: &CountTable, id: &str) -> impl Fn(Stage) -> u64 + use<> {
    let counts = table.get(id).cloned().unwrap_or_default();
    move |stage| counts.get(&stage).copied().unwrap_or(0)
}

/// Compare recorded and derived status for every item.
///
/// With `fix`, corrections go out in a single registry update. Artifact
/// counts are gathered before the registry lock is taken.
pub fn audit(registry: &Registry, validator: &OutputValidator, fix: bool) -> Result<AuditReport> {
    let snapshot = registry.list()?;
    let table = count_table(&snapshot, validator)?;

    let mut report = AuditReport {
        checked: snapshot.len(),
        ..Default::default()
    };

    for item in &snapshot {
        let counts = lookup(&table, &item.id);
        let derived = derive_item(item, &counts);
        if derived != item.status {
            report.mismatches.push(StatusMismatch {
                item_id: item.id.clone(),
                recorded: item.status,
                derived,
                fixable: !item.status.is_sticky(),
            });
        }
        let violations = item.invariant_violations(&counts);
        if !violations.is_empty() {
            report
                .invariant_violations
                .insert(item.id.clone(), violations);
        }
    }

    if fix && report.mismatches.iter().any(|m| m.fixable) {
        report.fixed = registry.update_all(|items| {
            let mut fixed = 0;
            for item in items.iter_mut() {
                if item.status.is_sticky() {
                    continue;
                }
                let counts = lookup(&table, &item.id);
                if refresh(item, counts) {
                    tracing::info!(item = %item.id, status = %item.status, "Reconciled status");
                    fixed += 1;
                }
            }
            (fixed, fixed > 0)
        })?;
    }

    Ok(report)
}
