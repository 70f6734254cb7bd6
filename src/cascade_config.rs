//! `.cascade/cascade.toml` parsing, environment overrides and validation.
//!
//! ```toml
//! [executor]
//! command = "claude"
//! timeout_secs = 1800
//! skip_permissions = true
//!
//! [pipeline]
//! threshold = 20
//! poll_interval_secs = 5
//! max_parallel = 2
//!
//! [validator]
//! max_age_secs = 86400
//! max_retries = 1
//!
//! [retrieval]
//! checkpoint_every = 10
//! session_rotation = 50
//! min_delay_ms = 1000
//! max_delay_ms = 3000
//!
//! [stages.retrieval]
//! mode = "native"
//!
//! [stages.extraction]
//! artifact = "products.jsonl"
//! instructions = "prompts/extraction.md"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::CheckpointSettings;
use crate::errors::CascadeError;
use crate::executor::claude::ExecutorSettings;
use crate::pipeline::PipelineSettings;
use crate::retrieval::RetrievalSettings;
use crate::stage::{ArtifactKind, Stage, StageCatalog, StageMode, StageSpec};

pub const CONFIG_FILE: &str = "cascade.toml";

/// Task executor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_command")]
    pub command: String,
    /// Replaces the default flag set entirely when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Keep prompt and transcript files under `.cascade/logs`
    #[serde(default = "default_true")]
    pub log_transcripts: bool,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_skip_permissions() -> bool {
    true
}

fn default_true() -> bool {
    true
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            flags: None,
            timeout_secs: default_timeout_secs(),
            skip_permissions: default_skip_permissions(),
            log_transcripts: true,
        }
    }
}

impl ExecutorSection {
    pub fn effective_flags(&self) -> Vec<String> {
        if let Some(flags) = &self.flags {
            return flags.clone();
        }
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }
}

/// Cascade mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_iterations_per_stage")]
    pub max_iterations_per_stage: u32,
}

fn default_threshold() -> u64 {
    20
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_parallel() -> usize {
    2
}

fn default_max_iterations_per_stage() -> u32 {
    50
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            poll_interval_secs: default_poll_interval_secs(),
            max_parallel: default_max_parallel(),
            max_iterations_per_stage: default_max_iterations_per_stage(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSection {
    /// Artifacts older than this fail validation
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_retries() -> u32 {
    crate::orchestrator::MAX_RETRIES
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Sub-unit pacing and checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_session_rotation")]
    pub session_rotation: usize,
    #[serde(default = "default_block_burst")]
    pub block_burst: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_block_rotations")]
    pub max_block_rotations: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Empty means the built-in rotation list
    #[serde(default)]
    pub user_agents: Vec<String>,
}

fn default_checkpoint_every() -> usize {
    10
}

fn default_session_rotation() -> usize {
    50
}

fn default_block_burst() -> usize {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_block_rotations() -> u32 {
    2
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            checkpoint_every: default_checkpoint_every(),
            session_rotation: default_session_rotation(),
            block_burst: default_block_burst(),
            cooldown_secs: default_cooldown_secs(),
            max_block_rotations: default_max_block_rotations(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agents: Vec::new(),
        }
    }
}

/// Per-stage overrides. Unset fields keep the stage defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_token: Option<String>,
    /// File name (line artifacts) or directory name (file artifacts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StageMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<PathBuf>,
    /// Executor command for this stage only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// The complete cascade.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeToml {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub validator: ValidatorSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub stages: BTreeMap<String, StageSection>,
}

impl CascadeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cascade.toml")
    }

    /// Defaults when `<state_dir>/cascade.toml` does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cascade.toml")?;
        crate::util::write_atomic(path, content.as_bytes())
    }

    /// Apply `CASCADE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(cmd) = lookup("CASCADE_EXECUTOR_CMD") {
            self.executor.command = cmd;
        }
        if let Some(v) = lookup("CASCADE_SKIP_PERMISSIONS") {
            self.executor.skip_permissions = v != "false";
        }
        if let Some(v) = env_number(&lookup, "CASCADE_TIMEOUT_SECS")? {
            self.executor.timeout_secs = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_THRESHOLD")? {
            self.pipeline.threshold = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_POLL_INTERVAL_SECS")? {
            self.pipeline.poll_interval_secs = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_SESSION_ROTATION")? {
            self.retrieval.session_rotation = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_MIN_DELAY_MS")? {
            self.retrieval.min_delay_ms = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_MAX_DELAY_MS")? {
            self.retrieval.max_delay_ms = v;
        }
        if let Some(v) = env_number(&lookup, "CASCADE_MAX_AGE_SECS")? {
            self.validator.max_age_secs = v;
        }
        Ok(())
    }

    /// Every problem found; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.validator.max_retries != crate::orchestrator::MAX_RETRIES {
            errors.push(format!(
                "validator.max_retries must be {} (got {})",
                crate::orchestrator::MAX_RETRIES,
                self.validator.max_retries
            ));
        }
        if self.retrieval.min_delay_ms > self.retrieval.max_delay_ms {
            errors.push(format!(
                "retrieval.min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.retrieval.min_delay_ms, self.retrieval.max_delay_ms
            ));
        }
        if self.executor.command.trim().is_empty() {
            errors.push("executor.command is empty".to_string());
        }
        if self.executor.timeout_secs == 0 {
            errors.push("executor.timeout_secs must be positive".to_string());
        }
        if self.pipeline.poll_interval_secs == 0 {
            errors.push("pipeline.poll_interval_secs must be positive".to_string());
        }
        for (field, value) in [
            ("retrieval.checkpoint_every", self.retrieval.checkpoint_every),
            ("retrieval.session_rotation", self.retrieval.session_rotation),
            ("retrieval.block_burst", self.retrieval.block_burst),
        ] {
            if value == 0 {
                errors.push(format!("{} must be positive", field));
            }
        }

        for name in self.stages.keys() {
            if let Err(e) = name.parse::<Stage>() {
                errors.push(format!("[stages.{}]: {}", name, e));
            }
        }
        if let Err(e) = self.catalog() {
            errors.push(e.to_string());
        }
        errors
    }

    /// Fail with every validation error joined.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        Err(CascadeError::Config(errors.join("; ")).into())
    }

    pub fn stage_section(&self, stage: Stage) -> Option<&StageSection> {
        self.stages
            .iter()
            .find(|(name, _)| name.parse::<Stage>().ok() == Some(stage))
            .map(|(_, section)| section)
    }

    /// Resolve every stage, applying `[stages.<name>]` overrides.
    pub fn catalog(&self) -> Result<StageCatalog> {
        let specs = Stage::ALL.iter().map(|stage| {
            let mut spec = StageSpec::default_for(*stage);
            let Some(section) = self.stage_section(*stage) else {
                return spec;
            };
            if let Some(token) = &section.done_token {
                spec.done_token = token.clone();
            }
            if let Some(token) = &section.blocked_token {
                spec.blocked_token = token.clone();
            }
            match &mut spec.artifact {
                ArtifactKind::Lines { file } => {
                    if let Some(name) = &section.artifact {
                        *file = name.clone();
                    }
                }
                ArtifactKind::Files { dir, extension } => {
                    if let Some(name) = &section.artifact {
                        *dir = name.clone();
                    }
                    if let Some(ext) = &section.extension {
                        *extension = ext.trim_start_matches('.').to_string();
                    }
                }
            }
            if let Some(mode) = section.mode {
                spec.mode = mode;
            }
            spec.instructions_file = section.instructions.clone();
            spec
        });
        StageCatalog::from_specs(specs.collect::<Vec<_>>())
    }

    pub fn checkpoint_settings(&self) -> CheckpointSettings {
        let r = &self.retrieval;
        CheckpointSettings {
            flush_every: r.checkpoint_every,
            session_rotation: r.session_rotation,
            block_burst: r.block_burst,
            cooldown: Duration::from_secs(r.cooldown_secs),
            max_block_rotations: r.max_block_rotations,
            min_delay: Duration::from_millis(r.min_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
        }
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        let mut settings = RetrievalSettings {
            request_timeout: Duration::from_secs(self.retrieval.request_timeout_secs),
            checkpoint: self.checkpoint_settings(),
            ..Default::default()
        };
        if !self.retrieval.user_agents.is_empty() {
            settings.user_agents = self.retrieval.user_agents.clone();
        }
        settings
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            threshold: self.pipeline.threshold,
            poll_interval: Duration::from_secs(self.pipeline.poll_interval_secs),
            max_iterations_per_stage: self.pipeline.max_iterations_per_stage,
            max_parallel: self.pipeline.max_parallel,
        }
    }

    /// Executor settings for `stage`, honouring a per-stage command.
    pub fn executor_settings(
        &self,
        stage: Option<Stage>,
        working_dir: &Path,
        log_dir: &Path,
    ) -> ExecutorSettings {
        let command = stage
            .and_then(|s| self.stage_section(s))
            .and_then(|s| s.command.clone())
            .unwrap_or_else(|| self.executor.command.clone());
        ExecutorSettings {
            command,
            flags: self.executor.effective_flags(),
            timeout: Duration::from_secs(self.executor.timeout_secs),
            working_dir: working_dir.to_path_buf(),
            log_dir: self
                .executor
                .log_transcripts
                .then(|| log_dir.to_path_buf()),
        }
    }
}

fn env_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| CascadeError::Config(format!("{} must be a number, got '{}'", key, raw)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = CascadeToml::parse("").unwrap();
        assert_eq!(config.executor.command, "claude");
        assert_eq!(config.pipeline.threshold, 20);
        assert_eq!(config.pipeline.poll_interval_secs, 5);
        assert_eq!(config.validator.max_retries, 1);
        assert_eq!(config.retrieval.session_rotation, 50);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_default_flags() {
        let config = CascadeToml::default();
        assert_eq!(
            config.executor.effective_flags(),
            [
                "--dangerously-skip-permissions",
                "--print",
                "--output-format",
                "stream-json",
                "--verbose"
            ]
        );

        let mut config = CascadeToml::default();
        config.executor.skip_permissions = false;
        assert!(
            !config
                .executor
                .effective_flags()
                .contains(&"--dangerously-skip-permissions".to_string())
        );
    }

    #[test]
    fn test_rejects_other_retry_counts() {
        let config = CascadeToml::parse("[validator]\nmax_retries = 3\n").unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("max_retries"));
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn test_rejects_inverted_delay_range() {
        let config =
            CascadeToml::parse("[retrieval]\nmin_delay_ms = 5000\nmax_delay_ms = 100\n").unwrap();
        assert!(config.validate()[0].contains("min_delay_ms"));
    }

    #[test]
    fn test_rejects_unknown_stage_section() {
        let config = CascadeToml::parse("[stages.crawl]\nmode = \"native\"\n").unwrap();
        assert!(config.validate().iter().any(|e| e.contains("stages.crawl")));
    }

    #[test]
    fn test_stage_overrides_build_catalog() {
        let config = CascadeToml::parse(
            r#"
[stages.retrieval]
mode = "native"
artifact = "pages"
extension = ".htm"

[stages.extraction]
artifact = "products.jsonl"
done_token = "PRODUCTS_OK"
instructions = "prompts/extract.md"
"#,
        )
        .unwrap();
        let catalog = config.catalog().unwrap();

        let retrieval = catalog.get(Stage::Retrieval);
        assert_eq!(retrieval.mode, StageMode::Native);
        assert_eq!(
            retrieval.artifact,
            ArtifactKind::Files {
                dir: "pages".into(),
                extension: "htm".into()
            }
        );

        let extraction = catalog.get(Stage::Extraction);
        assert_eq!(extraction.done_token, "PRODUCTS_OK");
        assert_eq!(extraction.blocked_token, "EXTRACTION_BLOCKED");
        assert_eq!(
            extraction.artifact_path(Path::new("/out")),
            PathBuf::from("/out/products.jsonl")
        );
        assert_eq!(
            extraction.instructions_file,
            Some(PathBuf::from("prompts/extract.md"))
        );
    }

    #[test]
    fn test_native_mode_outside_retrieval_is_invalid() {
        let config = CascadeToml::parse("[stages.discovery]\nmode = \"native\"\n").unwrap();
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CASCADE_EXECUTOR_CMD", "/usr/local/bin/fake"),
            ("CASCADE_THRESHOLD", "7"),
            ("CASCADE_MIN_DELAY_MS", "0"),
            ("CASCADE_MAX_AGE_SECS", "60"),
        ]);
        let mut config = CascadeToml::default();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.executor.command, "/usr/local/bin/fake");
        assert_eq!(config.pipeline.threshold, 7);
        assert_eq!(config.retrieval.min_delay_ms, 0);
        assert_eq!(config.validator.max_age_secs, 60);
    }

    #[test]
    fn test_env_rejects_non_numeric() {
        let mut config = CascadeToml::default();
        let err = config
            .apply_env_from(|k| (k == "CASCADE_THRESHOLD").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CASCADE_THRESHOLD"));
    }

    #[test]
    fn test_per_stage_command() {
        let config = CascadeToml::parse("[stages.enrichment]\ncommand = \"enricher\"\n").unwrap();
        let dir = Path::new("/work");
        let logs = Path::new("/work/.cascade/logs");
        assert_eq!(
            config
                .executor_settings(Some(Stage::Enrichment), dir, logs)
                .command,
            "enricher"
        );
        let default = config.executor_settings(Some(Stage::Discovery), dir, logs);
        assert_eq!(default.command, "claude");
        assert_eq!(default.log_dir, Some(logs.to_path_buf()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = CascadeToml::default();
        config.pipeline.threshold = 3;
        config.stages.insert(
            "retrieval".into(),
            StageSection {
                mode: Some(StageMode::Native),
                ..Default::default()
            },
        );
        config.save(&path).unwrap();

        let loaded = CascadeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.pipeline.threshold, 3);
        assert_eq!(
            loaded.stage_section(Stage::Retrieval).unwrap().mode,
            Some(StageMode::Native)
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = CascadeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.executor.timeout_secs, 1800);
    }
}
