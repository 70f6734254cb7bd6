//! Single corrective retry after a rejected completion claim.

use anyhow::Result;
use std::sync::Arc;

use crate::executor::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::registry::WorkItem;
use crate::stage::StageSpec;
use crate::validator::{OutputValidator, ValidationReport};

/// Corrective retries per completion claim. Configuration rejects any other value.
pub const MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryResult {
    Recovered(ValidationReport),
    StillInvalid(ValidationReport),
    /// The retry answered with the blocked token
    Blocked,
}

#[derive(Clone)]
pub struct RetryCoordinator {
    validator: Arc<OutputValidator>,
}

impl RetryCoordinator {
    pub fn new(validator: Arc<OutputValidator>) -> Self {
        Self { validator }
    }

    /// Directive embedding the validator's error.
    pub fn directive(spec: &StageSpec, failure: &ValidationReport, artifact: &str) -> String {
        let error = failure.error.as_deref().unwrap_or("output could not be verified");
        format!(
            "Your previous run reported {done}, but verification failed: {error}.\n\
             You MUST write the stage output to {artifact} before reporting completion.\n\
             Do not output {done} unless the file exists and contains at least one record.\n\
             If the source cannot be accessed, output {blocked} instead.",
            done = spec.done_token,
            blocked = spec.blocked_token,
            error = error,
            artifact = artifact,
        )
    }

    /// Invoke the executor once with the corrected request and re-validate.
    pub async fn retry(
        &self,
        executor: &dyn TaskExecutor,
        corrected: &ExecutionRequest,
        item: &WorkItem,
    ) -> Result<(RetryResult, ExecutionOutcome)> {
        tracing::warn!(
            item = %item.id,
            stage = %corrected.stage,
            attempt = corrected.attempt,
            "Completion claim rejected, issuing corrective retry"
        );
        let outcome = executor.execute(corrected).await?;
        if outcome.blocked() {
            return Ok((RetryResult::Blocked, outcome));
        }
        let report = self.validator.validate(item, corrected.stage)?;
        let result = if report.valid {
            RetryResult::Recovered(report)
        } else {
            RetryResult::StillInvalid(report)
        };
        Ok((result, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;

    #[test]
    fn test_directive_embeds_error_and_tokens() {
        let spec = StageSpec::default_for(Stage::Extraction);
        let failure = ValidationReport {
            valid: false,
            count: 0,
            error: Some("0 records found in out/records.jsonl, expected >0".into()),
        };
        let text = RetryCoordinator::directive(&spec, &failure, "out/records.jsonl");
        assert!(text.contains("0 records found in out/records.jsonl, expected >0"));
        assert!(text.contains("EXTRACTION_DONE"));
        assert!(text.contains("EXTRACTION_BLOCKED"));
        assert!(text.contains("You MUST write"));
    }
}
