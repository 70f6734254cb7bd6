//! Per-item, per-stage sub-unit checkpoints.
//!
//! Documents live at `<root>/<item_id>/<stage>.json`:
//!
//! ```json
//! {"processed": ["https://a"], "failed": [], "blocked": [], "last_updated": "..."}
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::stage::Stage;
use crate::util::{path_component, write_atomic};

/// Terminal outcome of one sub-unit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubUnitOutcome {
    Processed,
    /// Transient failure (network, timeout, unexpected status)
    Failed,
    /// Access-denied class response
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointCounts {
    pub processed: u64,
    pub failed: u64,
    pub blocked: u64,
}

impl CheckpointCounts {
    pub fn total(&self) -> u64 {
        self.processed + self.failed + self.blocked
    }
}

/// Which sub-units a stage has handled. The three sets are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub processed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub blocked: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn contains(&self, id: &str) -> bool {
        self.outcome_of(id).is_some()
    }

    pub fn outcome_of(&self, id: &str) -> Option<SubUnitOutcome> {
        if self.processed.contains(id) {
            Some(SubUnitOutcome::Processed)
        } else if self.failed.contains(id) {
            Some(SubUnitOutcome::Failed)
        } else if self.blocked.contains(id) {
            Some(SubUnitOutcome::Blocked)
        } else {
            None
        }
    }

    /// Put `id` into exactly one set. Returns whether anything changed.
    pub fn record(&mut self, id: &str, outcome: SubUnitOutcome) -> bool {
        if self.outcome_of(id) == Some(outcome) {
            return false;
        }
        self.processed.remove(id);
        self.failed.remove(id);
        self.blocked.remove(id);
        match outcome {
            SubUnitOutcome::Processed => self.processed.insert(id.to_string()),
            SubUnitOutcome::Failed => self.failed.insert(id.to_string()),
            SubUnitOutcome::Blocked => self.blocked.insert(id.to_string()),
        };
        true
    }

    pub fn counts(&self) -> CheckpointCounts {
        CheckpointCounts {
            processed: self.processed.len() as u64,
            failed: self.failed.len() as u64,
            blocked: self.blocked.len() as u64,
        }
    }

    pub fn is_disjoint(&self) -> bool {
        self.processed.is_disjoint(&self.failed)
            && self.processed.is_disjoint(&self.blocked)
            && self.failed.is_disjoint(&self.blocked)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, item_id: &str, stage: Stage) -> PathBuf {
        self.root
            .join(path_component(item_id))
            .join(format!("{}.json", stage.as_str()))
    }

    /// Load a checkpoint, if one was ever written.
    pub fn load_existing(&self, item_id: &str, stage: Stage) -> Result<Option<Checkpoint>> {
        let path = self.path_for(item_id, stage);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read checkpoint {}", path.display()));
            }
        };
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Load a checkpoint or start an empty one.
    pub fn load(&self, item_id: &str, stage: Stage) -> Result<Checkpoint> {
        Ok(self.load_existing(item_id, stage)?.unwrap_or_default())
    }

    pub fn save(&self, item_id: &str, stage: Stage, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.last_updated = Some(Utc::now());
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        write_atomic(&self.path_for(item_id, stage), json.as_bytes())
    }

    /// Delete a checkpoint. Returns whether one existed.
    pub fn reset(&self, item_id: &str, stage: Stage) -> Result<bool> {
        let path = self.path_for(item_id, stage);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
