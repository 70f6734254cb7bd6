//! Typed error hierarchy for the cascade orchestrator.
//!
//! Most code propagates `anyhow::Error`; these variants mark the failures
//! callers need to tell apart (exit codes, item-level handling).

use crate::stage::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Errors with a defined handling policy.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Sub-unit level network or timeout failure. Recorded in the checkpoint.
    #[error("Transient failure on {sub_unit}: {message}")]
    TransientFailure { sub_unit: String, message: String },

    /// Access-denied class signal. The item halts as blocked.
    #[error("Item {item_id} permanently blocked during {stage}")]
    PermanentBlock { item_id: String, stage: Stage },

    /// The executor claimed completion but the artifacts disagree.
    #[error("Validation mismatch for {item_id} ({stage}): {message}")]
    ValidationMismatch {
        item_id: String,
        stage: Stage,
        message: String,
    },

    /// The upstream artifact a stage needs is absent or empty.
    #[error("Item {item_id} cannot run {stage}: upstream artifact {path} is missing or empty")]
    DependencyMissing {
        item_id: String,
        stage: Stage,
        path: PathBuf,
    },

    #[error("Registry at {path} is corrupt: {message}")]
    RegistryCorruption { path: PathBuf, message: String },

    #[error("Registry not found at {path}. Run 'cascade add' to create it")]
    RegistryMissing { path: PathBuf },

    #[error("Item {id} not found in registry")]
    ItemNotFound { id: String },

    #[error("Executor command '{command}' could not be started: {source}")]
    ExecutorMissing {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CascadeError {
    /// Process exit code for errors that abort a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            CascadeError::RegistryCorruption { .. } | CascadeError::RegistryMissing { .. } => 2,
            CascadeError::ExecutorMissing { .. } => 3,
            _ => 1,
        }
    }
}

/// Exit code for an arbitrary error chain: the first `CascadeError` found decides.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<CascadeError>())
        .map(CascadeError::exit_code)
        .unwrap_or(1)
}
