pub mod controller;
pub mod prompt;
pub mod retry;
pub mod sequential;
pub mod summary;

use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::executor::ExecutorSet;
use crate::registry::Registry;
use crate::stage::StageCatalog;
use crate::ui::RunUI;
use crate::validator::OutputValidator;

pub use controller::{IterationOutcome, IterationReport, StageController};
pub use prompt::PromptBuilder;
pub use retry::{MAX_RETRIES, RetryCoordinator, RetryResult};
pub use sequential::run_sequential;
pub use summary::SessionSummary;

/// Collaborators shared by every stage controller of a run.
pub struct Engine {
    pub registry: Registry,
    pub catalog: Arc<StageCatalog>,
    pub validator: Arc<OutputValidator>,
    pub executors: ExecutorSet,
    pub checkpoints: CheckpointStore,
    pub prompts: PromptBuilder,
    pub ui: Option<Arc<RunUI>>,
}
