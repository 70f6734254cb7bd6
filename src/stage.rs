//! Pipeline stage catalogue.
//!
//! This module provides:
//! - `Stage`, the four ordered pipeline stages
//! - `ArtifactKind`, how a stage's output is stored and counted
//! - `StageSpec`, the resolved per-stage definition (tokens, artifact, mode)
//! - `StageCatalog`, the full set of resolved specs used at runtime

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One phase of the scraping pipeline. Ordering follows pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Find the sub-units (URLs) belonging to a source
    Discovery,
    /// Download raw pages for every discovered sub-unit
    Retrieval,
    /// Turn raw pages into structured records
    Extraction,
    /// Enrich structured records
    Enrichment,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Discovery,
        Stage::Retrieval,
        Stage::Extraction,
        Stage::Enrichment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Retrieval => "retrieval",
            Stage::Extraction => "extraction",
            Stage::Enrichment => "enrichment",
        }
    }

    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }

    /// The stage whose artifacts feed this one.
    pub fn upstream(&self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// The stage that consumes this stage's artifacts.
    pub fn downstream(&self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_first(&self) -> bool {
        self.upstream().is_none()
    }

    pub fn is_last(&self) -> bool {
        self.downstream().is_none()
    }

    /// Stages that track individual sub-units in a checkpoint.
    pub fn resumable(&self) -> bool {
        matches!(self, Stage::Retrieval)
    }

    pub fn default_done_token(&self) -> String {
        format!("{}_DONE", self.as_str().to_uppercase())
    }

    pub fn default_blocked_token(&self) -> String {
        format!("{}_BLOCKED", self.as_str().to_uppercase())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "discovery" => Ok(Stage::Discovery),
            "retrieval" => Ok(Stage::Retrieval),
            "extraction" => Ok(Stage::Extraction),
            "enrichment" => Ok(Stage::Enrichment),
            _ => anyhow::bail!(
                "Invalid stage '{}'. Valid values: discovery, retrieval, extraction, enrichment",
                s
            ),
        }
    }
}

/// Where a stage writes its output and how produced records are counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Line-delimited file; count = non-empty lines
    Lines { file: String },
    /// Flat directory; count = files with the given extension
    Files { dir: String, extension: String },
}

impl ArtifactKind {
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Discovery => ArtifactKind::Lines {
                file: "urls.jsonl".to_string(),
            },
            Stage::Retrieval => ArtifactKind::Files {
                dir: "html".to_string(),
                extension: "html".to_string(),
            },
            Stage::Extraction => ArtifactKind::Lines {
                file: "records.jsonl".to_string(),
            },
            Stage::Enrichment => ArtifactKind::Lines {
                file: "enriched.jsonl".to_string(),
            },
        }
    }

    /// Resolve the artifact location inside an item's output directory.
    pub fn path(&self, output_dir: &Path) -> PathBuf {
        match self {
            ArtifactKind::Lines { file } => output_dir.join(file),
            ArtifactKind::Files { dir, .. } => output_dir.join(dir),
        }
    }
}

/// Who performs a stage's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    /// The external task executor (default)
    #[default]
    Executor,
    /// The in-process HTTP retriever (retrieval stage only)
    Native,
}

/// Fully resolved definition of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub stage: Stage,
    pub done_token: String,
    pub blocked_token: String,
    pub artifact: ArtifactKind,
    pub mode: StageMode,
    /// Instructions file handed to the executor; built-in template when absent
    pub instructions_file: Option<PathBuf>,
}

impl StageSpec {
    pub fn default_for(stage: Stage) -> Self {
        Self {
            stage,
            done_token: stage.default_done_token(),
            blocked_token: stage.default_blocked_token(),
            artifact: ArtifactKind::default_for(stage),
            mode: StageMode::default(),
            instructions_file: None,
        }
    }

    pub fn artifact_path(&self, output_dir: &Path) -> PathBuf {
        self.artifact.path(output_dir)
    }
}

/// Resolved specs for every stage.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    specs: BTreeMap<Stage, StageSpec>,
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self {
            specs: Stage::ALL
                .iter()
                .map(|s| (*s, StageSpec::default_for(*s)))
                .collect(),
        }
    }
}

impl StageCatalog {
    /// Build a catalog from explicit specs; missing stages use defaults.
    pub fn from_specs(specs: impl IntoIterator<Item = StageSpec>) -> Result<Self> {
        let mut catalog = Self::default();
        for spec in specs {
            if spec.done_token == spec.blocked_token {
                anyhow::bail!(
                    "Stage {} uses the same token '{}' for done and blocked",
                    spec.stage,
                    spec.done_token
                );
            }
            if spec.mode == StageMode::Native && spec.stage != Stage::Retrieval {
                anyhow::bail!("Native mode is only available for the retrieval stage");
            }
            catalog.specs.insert(spec.stage, spec);
        }
        Ok(catalog)
    }

    pub fn get(&self, stage: Stage) -> &StageSpec {
        // Every stage is populated by construction.
        &self.specs[&stage]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        self.specs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_neighbours() {
        assert_eq!(Stage::Discovery.upstream(), None);
        assert_eq!(Stage::Discovery.downstream(), Some(Stage::Retrieval));
        assert_eq!(Stage::Extraction.upstream(), Some(Stage::Retrieval));
        assert_eq!(Stage::Enrichment.downstream(), None);
        assert!(Stage::Discovery < Stage::Enrichment);
        assert!(Stage::Enrichment.is_last());
    }

    #[test]
    fn test_default_tokens() {
        assert_eq!(Stage::Retrieval.default_done_token(), "RETRIEVAL_DONE");
        assert_eq!(Stage::Discovery.default_blocked_token(), "DISCOVERY_BLOCKED");
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("Extraction".parse::<Stage>().unwrap(), Stage::Extraction);
        assert!("crawl".parse::<Stage>().is_err());
    }

    #[test]
    fn test_artifact_paths() {
        let out = Path::new("/data/acme");
        assert_eq!(
            StageSpec::default_for(Stage::Discovery).artifact_path(out),
            PathBuf::from("/data/acme/urls.jsonl")
        );
        assert_eq!(
            StageSpec::default_for(Stage::Retrieval).artifact_path(out),
            PathBuf::from("/data/acme/html")
        );
    }

    #[test]
    fn test_catalog_rejects_identical_tokens() {
        let mut spec = StageSpec::default_for(Stage::Extraction);
        spec.blocked_token = spec.done_token.clone();
        assert!(StageCatalog::from_specs([spec]).is_err());
    }

    #[test]
    fn test_catalog_rejects_native_outside_retrieval() {
        let mut spec = StageSpec::default_for(Stage::Discovery);
        spec.mode = StageMode::Native;
        assert!(StageCatalog::from_specs([spec]).is_err());
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&Stage::Retrieval).unwrap();
        assert_eq!(json, "\"retrieval\"");
    }
}
