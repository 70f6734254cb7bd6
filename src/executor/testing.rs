//! Scripted `TaskExecutor` for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{ExecutionOutcome, ExecutionRequest, TaskExecutor};

type Step = Box<dyn Fn(&ExecutionRequest) -> String + Send + Sync>;

/// Replays one step per call. Once the script runs out, `fallback` answers
/// (empty transcript by default, i.e. an ambiguous run).
#[derive(Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<Step>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call returns `transcript`.
    pub fn always(transcript: &str) -> Self {
        let transcript = transcript.to_string();
        Self {
            fallback: Some(Box::new(move |_| transcript.clone())),
            ..Self::default()
        }
    }

    pub fn then(self, step: impl Fn(&ExecutionRequest) -> String + Send + Sync + 'static) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(Box::new(step));
        }
        self
    }

    pub fn otherwise(
        mut self,
        step: impl Fn(&ExecutionRequest) -> String + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(step));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        let raw = match (step, &self.fallback) {
            (Some(step), _) => step(request),
            (None, Some(fallback)) => fallback(request),
            (None, None) => String::new(),
        };
        Ok(ExecutionOutcome::from_transcript(
            request,
            raw,
            Some(0),
            false,
            Duration::from_millis(1),
        ))
    }
}
