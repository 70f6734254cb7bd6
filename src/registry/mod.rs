pub mod item;
pub mod store;

pub use item::{BlockClassification, BlockEvent, ItemStatus, StageProgress, WorkItem};
pub use store::{Registry, RegistryDocument, sort_by_priority};
