//! Bookkeeping for a resumable sub-unit loop.
//!
//! `CheckpointManager` wraps one checkpoint document and decides, after every
//! recorded sub-unit, whether the caller should keep going, rotate its
//! session (connection/identity) after a cooldown, or halt the item.

use anyhow::Result;
use rand::Rng;
use std::time::Duration;

use super::store::{Checkpoint, CheckpointStore, SubUnitOutcome};
use crate::stage::Stage;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSettings {
    /// Persist after this many newly recorded sub-units
    pub flush_every: usize,
    /// Rotate the session after this many sub-units on it
    pub session_rotation: usize,
    /// Consecutive blocks that force an early rotation
    pub block_burst: usize,
    /// Pause before resuming on a fresh session
    pub cooldown: Duration,
    /// Block-triggered rotations without a success before halting the item
    pub max_block_rotations: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            flush_every: 10,
            session_rotation: 50,
            block_burst: 3,
            cooldown: Duration::from_secs(60),
            max_block_rotations: 2,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    SessionLimit,
    BlockBurst,
}

/// What the sub-unit loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Rotate {
        reason: RotationReason,
        cooldown: Duration,
    },
    /// Blocks persist across rotations; the item is permanently blocked
    Halt,
}

pub struct CheckpointManager {
    store: CheckpointStore,
    item_id: String,
    stage: Stage,
    checkpoint: Checkpoint,
    settings: CheckpointSettings,
    unflushed: usize,
    session_count: usize,
    consecutive_blocks: usize,
    block_rotations: u32,
}

impl CheckpointManager {
    pub fn open(
        store: CheckpointStore,
        item_id: &str,
        stage: Stage,
        settings: CheckpointSettings,
    ) -> Result<Self> {
        let checkpoint = store.load(item_id, stage)?;
        Ok(Self {
            store,
            item_id: item_id.to_string(),
            stage,
            checkpoint,
            settings,
            unflushed: 0,
            session_count: 0,
            consecutive_blocks: 0,
            block_rotations: 0,
        })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// False only once the sub-unit was processed. Failed and blocked ones
    /// are tried again; `record` then moves them to their new set.
    pub fn should_process(&self, id: &str) -> bool {
        self.checkpoint.outcome_of(id) != Some(SubUnitOutcome::Processed)
    }

    pub fn record(&mut self, id: &str, outcome: SubUnitOutcome) -> Result<Directive> {
        if self.checkpoint.record(id, outcome) {
            self.unflushed += 1;
        }
        self.session_count += 1;

        match outcome {
            SubUnitOutcome::Blocked => self.consecutive_blocks += 1,
            SubUnitOutcome::Processed => {
                self.consecutive_blocks = 0;
                self.block_rotations = 0;
            }
            SubUnitOutcome::Failed => self.consecutive_blocks = 0,
        }

        if self.unflushed >= self.settings.flush_every.max(1) {
            self.flush()?;
        }

        if self.consecutive_blocks >= self.settings.block_burst.max(1) {
            if self.block_rotations >= self.settings.max_block_rotations {
                self.flush()?;
                return Ok(Directive::Halt);
            }
            self.block_rotations += 1;
            return Ok(self.rotate(RotationReason::BlockBurst));
        }

        if self.settings.session_rotation > 0 && self.session_count >= self.settings.session_rotation
        {
            return Ok(self.rotate(RotationReason::SessionLimit));
        }

        Ok(Directive::Continue)
    }

    fn rotate(&mut self, reason: RotationReason) -> Directive {
        self.session_count = 0;
        self.consecutive_blocks = 0;
        Directive::Rotate {
            reason,
            cooldown: self.settings.cooldown,
        }
    }

    /// Random pause before the next sub-unit.
    pub fn next_delay(&self) -> Duration {
        let min = self.settings.min_delay;
        let max = self.settings.max_delay;
        if max <= min {
            return min;
        }
        let ms = rand::rng().random_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(ms as u64)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed == 0 && self.checkpoint.last_updated.is_some() {
            return Ok(());
        }
        self.store
            .save(&self.item_id, self.stage, &mut self.checkpoint)?;
        self.unflushed = 0;
        Ok(())
    }

    /// Flush unconditionally and hand back the final checkpoint.
    pub fn finish(mut self) -> Result<Checkpoint> {
        self.flush()?;
        Ok(std::mem::take(&mut self.checkpoint))
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        // Cancellation drops the manager mid-loop; keep what was recorded.
        if self.unflushed > 0
            && let Err(e) = self.store.save(&self.item_id, self.stage, &mut self.checkpoint)
        {
            tracing::warn!(item = %self.item_id, stage = %self.stage, error = %e, "Failed to flush checkpoint on drop");
        }
    }
}
