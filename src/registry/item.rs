//! Work item model stored in the registry document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::stage::Stage;

/// Lifecycle status of an item (and of each of its stages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Terminal for automatic selection; only `unblock` leaves it
    Blocked,
    /// Manually parked; never selected or reconciled
    Skip,
}

impl ItemStatus {
    /// Statuses that automatic selection may pick up.
    pub fn is_selectable(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::InProgress)
    }

    /// Statuses that reconciliation must never change.
    pub fn is_sticky(&self) -> bool {
        matches!(self, ItemStatus::Blocked | ItemStatus::Skip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Skip => "skip",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockClassification {
    /// The executor or retriever hit an access-denied class barrier
    AntiBot,
    /// A stage's upstream artifact was absent or empty
    DependencyMissing,
    /// Set by the audit from blocked sub-unit counters
    Reconciled,
}

impl std::fmt::Display for BlockClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockClassification::AntiBot => "anti-bot",
            BlockClassification::DependencyMissing => "dependency-missing",
            BlockClassification::Reconciled => "reconciled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub classification: BlockClassification,
    /// The stage's produced count when the block was recorded
    pub count_at_block: u64,
}

/// Counters and status for one stage of one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default)]
    pub discovered: u64,
    #[serde(default)]
    pub produced: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub blocked: u64,
    #[serde(default)]
    pub status: ItemStatus,
    /// Set when the validator confirmed a completion claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StageProgress {
    pub fn attempted(&self) -> u64 {
        self.produced + self.failed + self.blocked
    }

    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }

    /// Whether a controller still has executor work to do for this stage.
    pub fn needs_work(&self) -> bool {
        !self.is_verified()
            && matches!(self.status, ItemStatus::Pending | ItemStatus::InProgress)
    }

    /// Store fresh counters. `produced` is clamped so the attempted
    /// quantity never exceeds `discovered`; a stage may emit several records
    /// per upstream unit.
    pub fn set_counts(&mut self, discovered: u64, produced: u64, failed: u64, blocked: u64) {
        self.failed = failed;
        self.blocked = blocked;
        self.discovered = discovered.max(failed + blocked);
        self.produced = produced.min(self.discovered - failed - blocked);
    }
}

/// One scraping target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub name: String,
    /// Target endpoint
    pub url: String,
    /// Where stage artifacts are written
    pub output_dir: PathBuf,
    /// Lower runs first
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageProgress>,
    #[serde(default)]
    pub block_events: Vec<BlockEvent>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_priority() -> i64 {
    100
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            output_dir: output_dir.into(),
            priority: default_priority(),
            status: ItemStatus::Pending,
            stages: BTreeMap::new(),
            block_events: Vec::new(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Progress for a stage; stages never touched read as all-zero pending.
    pub fn stage(&self, stage: Stage) -> StageProgress {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageProgress {
        self.stages.entry(stage).or_default()
    }

    /// Whether automatic selection may run `stage` for this item.
    pub fn is_selectable_for(&self, stage: Stage) -> bool {
        self.status.is_selectable() && self.stage(stage).needs_work()
    }

    /// Halt the item: append a block event and mark stage and item blocked.
    pub fn record_block(&mut self, stage: Stage, classification: BlockClassification) {
        let progress = self.stage_mut(stage);
        progress.status = ItemStatus::Blocked;
        let count_at_block = progress.produced;
        self.block_events.push(BlockEvent {
            timestamp: Utc::now(),
            stage,
            classification,
            count_at_block,
        });
        self.status = ItemStatus::Blocked;
    }

    /// Manual return to `pending`. Block history is kept.
    pub fn unblock(&mut self) {
        for progress in self.stages.values_mut() {
            if progress.status == ItemStatus::Blocked {
                progress.status = ItemStatus::Pending;
                progress.blocked = 0;
                progress.attempts = 0;
                progress.verified_at = None;
            }
        }
        self.status = ItemStatus::Pending;
    }

    /// Describe every violated invariant. `downstream_count` returns the
    /// artifact count of a stage.
    pub fn invariant_violations(&self, downstream_count: impl Fn(Stage) -> u64) -> Vec<String> {
        let mut violations = Vec::new();

        for (stage, p) in &self.stages {
            if p.attempted() > p.discovered {
                violations.push(format!(
                    "{}: attempted {} exceeds discovered {}",
                    stage,
                    p.attempted(),
                    p.discovered
                ));
            }
        }

        match self.status {
            ItemStatus::Completed => {
                for stage in Stage::ALL {
                    let p = self.stage(stage);
                    let downstream_ok = match stage.downstream() {
                        Some(next) => downstream_count(next) > 0,
                        None => p.produced > 0,
                    };
                    if p.discovered == 0
                        || p.attempted() != p.discovered
                        || p.blocked > 0
                        || !downstream_ok
                    {
                        violations.push(format!(
                            "{}: completed item has incomplete counters ({}/{} attempted, {} blocked, downstream present: {})",
                            stage,
                            p.attempted(),
                            p.discovered,
                            p.blocked,
                            downstream_ok
                        ));
                    }
                }
            }
            ItemStatus::Blocked if self.block_events.is_empty() => {
                violations.push("blocked item has no block events".to_string());
            }
            _ => {}
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new("acme", "Acme Docs", "https://acme.test", "out/acme")
    }

    #[test]
    fn test_new_item_is_pending_and_selectable() {
        let item = item();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.priority, 100);
        assert!(item.is_selectable_for(Stage::Discovery));
        assert_eq!(item.stage(Stage::Retrieval), StageProgress::default());
    }

    #[test]
    fn test_set_counts_keeps_attempted_within_discovered() {
        let mut p = StageProgress::default();
        p.set_counts(10, 8, 1, 1);
        assert_eq!(p.discovered, 10);
        assert_eq!(p.attempted(), 10);

        p.set_counts(5, 8, 0, 0);
        assert_eq!(p.discovered, 5);
        assert_eq!(p.produced, 5);

        p.set_counts(2, 0, 1, 3);
        assert_eq!(p.discovered, 4);
        assert!(p.attempted() <= p.discovered);
    }

    #[test]
    fn test_record_block_appends_event_and_halts() {
        let mut item = item();
        item.stage_mut(Stage::Retrieval).produced = 69;
        item.record_block(Stage::Retrieval, BlockClassification::AntiBot);

        assert_eq!(item.status, ItemStatus::Blocked);
        assert_eq!(item.block_events.len(), 1);
        assert_eq!(item.block_events[0].count_at_block, 69);
        assert_eq!(item.block_events[0].classification, BlockClassification::AntiBot);
        assert!(!item.is_selectable_for(Stage::Retrieval));
        assert!(!item.is_selectable_for(Stage::Extraction));
    }

    #[test]
    fn test_unblock_returns_to_pending_and_keeps_history() {
        let mut item = item();
        item.stage_mut(Stage::Retrieval).blocked = 3;
        item.record_block(Stage::Retrieval, BlockClassification::AntiBot);
        item.unblock();

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.stage(Stage::Retrieval).status, ItemStatus::Pending);
        assert_eq!(item.stage(Stage::Retrieval).blocked, 0);
        assert_eq!(item.block_events.len(), 1);
        assert!(item.is_selectable_for(Stage::Retrieval));
    }

    #[test]
    fn test_verified_stage_needs_no_work() {
        let mut item = item();
        let p = item.stage_mut(Stage::Discovery);
        p.status = ItemStatus::InProgress;
        p.verified_at = Some(Utc::now());
        assert!(!item.is_selectable_for(Stage::Discovery));
    }

    #[test]
    fn test_invariant_violations_for_blocked_without_events() {
        let mut item = item();
        item.status = ItemStatus::Blocked;
        let violations = item.invariant_violations(|_| 0);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("no block events"));
    }

    #[test]
    fn test_invariant_violations_for_premature_completion() {
        let mut item = item();
        item.status = ItemStatus::Completed;
        item.stage_mut(Stage::Discovery).set_counts(100, 40, 0, 0);
        let violations = item.invariant_violations(|_| 1);
        assert!(violations.iter().any(|v| v.starts_with("discovery")));
    }

    #[test]
    fn test_serde_uses_stage_names_as_keys() {
        let mut item = item();
        item.stage_mut(Stage::Retrieval).discovered = 4;
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["stages"]["retrieval"]["discovered"], 4);
        assert_eq!(json["status"], "pending");

        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_minimal_document_deserializes_with_defaults() {
        let json = r#"{
            "id": "x", "name": "X", "url": "https://x.test", "output_dir": "out/x",
            "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let item: WorkItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.priority, 100);
        assert!(item.stages.is_empty());
    }
}
