pub mod manager;
pub mod store;

pub use manager::{CheckpointManager, CheckpointSettings, Directive, RotationReason};
pub use store::{Checkpoint, CheckpointCounts, CheckpointStore, SubUnitOutcome};
