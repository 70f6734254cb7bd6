use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::executor::ContextPacket;
use crate::stage::{Stage, StageSpec};

/// Renders the text handed to the executor: instructions, rules and the
/// context packet.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    project_dir: PathBuf,
}

impl PromptBuilder {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn render(&self, spec: &StageSpec, context: &ContextPacket) -> Result<String> {
        let instructions = match &spec.instructions_file {
            Some(file) => {
                let path = self.resolve(file);
                std::fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read instructions file {}", path.display())
                })?
            }
            None => default_instructions(spec.stage).to_string(),
        };
        let packet =
            serde_json::to_string_pretty(context).context("Failed to serialize context packet")?;

        let mut prompt = String::new();
        if let Some(directive) = &context.directive {
            prompt.push_str("## CORRECTIVE DIRECTIVE\n");
            prompt.push_str(directive);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            r#"## TASK
Stage: {stage}
Source: {name} ({url})

{instructions}

## CRITICAL RULES
1. Write your output to {artifact}
2. Output is verified on disk; claims without files are rejected
3. Only output {done} when the output is FULLY written
4. If the site denies access (captcha, 403, rate limiting that persists), output {blocked} and stop
5. Never output both tokens

## CONTEXT
```json
{packet}
```
"#,
            stage = spec.stage,
            name = context.name,
            url = context.url,
            instructions = instructions.trim_end(),
            artifact = context.artifact_path.display(),
            done = spec.done_token,
            blocked = spec.blocked_token,
            packet = packet,
        ));
        Ok(prompt)
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.project_dir.join(file)
        }
    }
}

fn default_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::Discovery => {
            "Find every content page belonging to the source. Append one JSON object per line \
             of the form {\"url\": \"...\"} to the artifact file."
        }
        Stage::Retrieval => {
            "Download the raw HTML of every URL in the upstream artifact into the artifact \
             directory, one .html file per page. Record each URL as processed, failed or \
             blocked in the checkpoint file and skip URLs already recorded there."
        }
        Stage::Extraction => {
            "Turn every downloaded page in the upstream directory into structured records. \
             Write one JSON object per line to the artifact file."
        }
        Stage::Enrichment => {
            "Enrich every record of the upstream artifact. Write one JSON object per line to \
             the artifact file."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StageProgress;
    use std::fs;
    use tempfile::tempdir;

    fn context(directive: Option<String>) -> ContextPacket {
        ContextPacket {
            item_id: "acme".into(),
            name: "Acme Docs".into(),
            url: "https://acme.test".into(),
            stage: Stage::Discovery,
            output_dir: PathBuf::from("out/acme"),
            artifact_path: PathBuf::from("out/acme/urls.jsonl"),
            upstream_artifact_path: None,
            checkpoint_path: None,
            counters: StageProgress::default(),
            attempt: 1,
            directive,
        }
    }

    #[test]
    fn test_default_prompt_carries_tokens_and_context() {
        let builder = PromptBuilder::new("/project");
        let prompt = builder
            .render(&StageSpec::default_for(Stage::Discovery), &context(None))
            .unwrap();
        assert!(prompt.contains("DISCOVERY_DONE"));
        assert!(prompt.contains("DISCOVERY_BLOCKED"));
        assert!(prompt.contains("\"item_id\": \"acme\""));
        assert!(prompt.contains("out/acme/urls.jsonl"));
        assert!(!prompt.contains("CORRECTIVE DIRECTIVE"));
    }

    #[test]
    fn test_directive_leads_the_prompt() {
        let builder = PromptBuilder::new("/project");
        let prompt = builder
            .render(
                &StageSpec::default_for(Stage::Discovery),
                &context(Some("0 records found, expected >0".into())),
            )
            .unwrap();
        assert!(prompt.starts_with("## CORRECTIVE DIRECTIVE\n0 records found"));
    }

    #[test]
    fn test_instructions_file_relative_to_project() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("prompts")).unwrap();
        fs::write(dir.path().join("prompts/discovery.md"), "Use the sitemap first.").unwrap();

        let mut spec = StageSpec::default_for(Stage::Discovery);
        spec.instructions_file = Some(PathBuf::from("prompts/discovery.md"));
        let prompt = PromptBuilder::new(dir.path())
            .render(&spec, &context(None))
            .unwrap();
        assert!(prompt.contains("Use the sitemap first."));

        spec.instructions_file = Some(PathBuf::from("prompts/missing.md"));
        assert!(PromptBuilder::new(dir.path()).render(&spec, &context(None)).is_err());
    }
}
