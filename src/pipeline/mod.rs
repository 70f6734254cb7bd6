//! Cascade mode: overlapping stage execution per item.

pub mod supervisor;
pub mod trigger;

pub use supervisor::{
    PipelineReport, PipelineSettings, PipelineSupervisor, StageStart, WorkerExit,
};
pub use trigger::{StartReason, ThresholdTrigger, TriggerDecision, UpstreamObservation};
