//! Boundary to the external task executor.
//!
//! Controllers hand an `ExecutionRequest` to a `TaskExecutor` and get back an
//! `ExecutionOutcome` whose signal was derived by `signals::scan`. Nothing
//! past this module looks at transcript text.

pub mod claude;
pub mod signals;
pub mod stream;

#[cfg(test)]
pub mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::StageProgress;
use crate::stage::Stage;

pub use claude::{ClaudeExecutor, ExecutorSettings};
pub use signals::Signal;

/// Structured description of the work handed to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPacket {
    pub item_id: String,
    pub name: String,
    pub url: String,
    pub stage: Stage,
    pub output_dir: PathBuf,
    /// Where this stage must write its output
    pub artifact_path: PathBuf,
    /// Input produced by the previous stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,
    pub counters: StageProgress,
    pub attempt: u32,
    /// Corrective directive on a retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub item_id: String,
    pub stage: Stage,
    pub attempt: u32,
    /// Full prompt text, context included
    pub instructions: String,
    pub context: ContextPacket,
    pub done_token: String,
    pub blocked_token: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub signal: Signal,
    pub raw: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Build an outcome by scanning `raw` for the request's tokens.
    pub fn from_transcript(
        request: &ExecutionRequest,
        raw: String,
        exit_code: Option<i32>,
        timed_out: bool,
        duration: Duration,
    ) -> Self {
        let signal = signals::scan(&raw, &request.done_token, &request.blocked_token);
        Self {
            signal,
            raw,
            exit_code,
            timed_out,
            duration,
        }
    }

    pub fn completed(&self) -> bool {
        self.signal == Signal::Completed
    }

    pub fn blocked(&self) -> bool {
        self.signal == Signal::Blocked
    }
}

/// Abstraction over stage execution.
/// Real implementations: `ClaudeExecutor`, `retrieval::HttpRetriever`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;
}

/// Executor per stage, with a shared default.
#[derive(Clone)]
pub struct ExecutorSet {
    default: Arc<dyn TaskExecutor>,
    overrides: BTreeMap<Stage, Arc<dyn TaskExecutor>>,
}

impl ExecutorSet {
    pub fn new(default: Arc<dyn TaskExecutor>) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, stage: Stage, executor: Arc<dyn TaskExecutor>) -> Self {
        self.overrides.insert(stage, executor);
        self
    }

    pub fn for_stage(&self, stage: Stage) -> Arc<dyn TaskExecutor> {
        self.overrides
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// One executor invocation, kept only long enough to log.
#[derive(Debug)]
pub struct StageRun<'a> {
    pub item_id: &'a str,
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub outcome: &'a ExecutionOutcome,
}

impl StageRun<'_> {
    pub fn log(&self) {
        tracing::info!(
            item = self.item_id,
            stage = %self.stage,
            attempt = self.attempt,
            started_at = %self.started_at.to_rfc3339(),
            duration_ms = self.outcome.duration.as_millis() as u64,
            signal = %self.outcome.signal,
            exit_code = ?self.outcome.exit_code,
            timed_out = self.outcome.timed_out,
            output_chars = self.outcome.raw.len(),
            "Executor run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedExecutor;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            item_id: "acme".into(),
            stage: Stage::Extraction,
            attempt: 1,
            instructions: String::new(),
            context: ContextPacket {
                item_id: "acme".into(),
                name: "Acme".into(),
                url: "https://acme.test".into(),
                stage: Stage::Extraction,
                output_dir: PathBuf::from("out"),
                artifact_path: PathBuf::from("out/records.jsonl"),
                upstream_artifact_path: Some(PathBuf::from("out/html")),
                checkpoint_path: None,
                counters: StageProgress::default(),
                attempt: 1,
                directive: None,
            },
            done_token: "EXTRACTION_DONE".into(),
            blocked_token: "EXTRACTION_BLOCKED".into(),
        }
    }

    #[test]
    fn test_outcome_scans_request_tokens() {
        let req = request();
        let outcome = ExecutionOutcome::from_transcript(
            &req,
            "wrote 3 records\nEXTRACTION_DONE".into(),
            Some(0),
            false,
            Duration::from_secs(1),
        );
        assert!(outcome.completed());
        assert!(!outcome.blocked());
    }

    #[test]
    fn test_context_packet_omits_empty_fields() {
        let json = serde_json::to_value(&request().context).unwrap();
        assert_eq!(json["stage"], "extraction");
        assert!(json.get("directive").is_none());
        assert!(json.get("checkpoint_path").is_none());
    }

    #[tokio::test]
    async fn test_executor_set_overrides() {
        let default = Arc::new(ScriptedExecutor::always("EXTRACTION_DONE"));
        let native = Arc::new(ScriptedExecutor::always("EXTRACTION_BLOCKED"));
        let set = ExecutorSet::new(default.clone()).with_override(Stage::Retrieval, native.clone());

        let req = request();
        let out = set.for_stage(Stage::Extraction).execute(&req).await.unwrap();
        assert!(out.completed());
        let out = set.for_stage(Stage::Retrieval).execute(&req).await.unwrap();
        assert!(out.blocked());
        assert_eq!(default.calls(), 1);
        assert_eq!(native.calls(), 1);
    }
}
