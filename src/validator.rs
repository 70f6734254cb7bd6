//! Artifact-based verification of stage completion claims.
//!
//! The executor's transcript is advisory. A stage only counts as having
//! produced output when its artifacts exist on disk, hold at least one
//! record, and were modified recently enough.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::registry::WorkItem;
use crate::stage::{ArtifactKind, Stage, StageCatalog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub count: u64,
    pub error: Option<String>,
}

impl ValidationReport {
    fn ok(count: u64) -> Self {
        Self {
            valid: true,
            count,
            error: None,
        }
    }

    fn invalid(count: u64, error: String) -> Self {
        Self {
            valid: false,
            count,
            error: Some(error),
        }
    }
}

/// Count and freshness of an artifact location.
#[derive(Debug, Clone, Copy, Default)]
struct ArtifactScan {
    exists: bool,
    count: u64,
    newest: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct OutputValidator {
    catalog: Arc<StageCatalog>,
    max_age: Duration,
}

impl OutputValidator {
    pub fn new(catalog: Arc<StageCatalog>, max_age: Duration) -> Self {
        Self { catalog, max_age }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Raw record count for polling; a missing artifact counts as zero.
    pub fn count(&self, item: &WorkItem, stage: Stage) -> Result<u64> {
        Ok(self.scan(item, stage)?.count)
    }

    pub fn validate(&self, item: &WorkItem, stage: Stage) -> Result<ValidationReport> {
        let path = self.catalog.get(stage).artifact_path(&item.output_dir);
        let scan = self.scan(item, stage)?;

        if !scan.exists {
            return Ok(ValidationReport::invalid(
                0,
                format!("artifact missing: {}", path.display()),
            ));
        }
        if scan.count == 0 {
            return Ok(ValidationReport::invalid(
                0,
                format!("0 records found in {}, expected >0", path.display()),
            ));
        }
        if let Some(newest) = scan.newest {
            // Clock skew into the future counts as fresh
            let age = SystemTime::now()
                .duration_since(newest)
                .unwrap_or(Duration::ZERO);
            if age > self.max_age {
                return Ok(ValidationReport::invalid(
                    scan.count,
                    format!(
                        "artifacts are stale: last modified {}s ago (max age {}s)",
                        age.as_secs(),
                        self.max_age.as_secs()
                    ),
                ));
            }
        }

        Ok(ValidationReport::ok(scan.count))
    }

    fn scan(&self, item: &WorkItem, stage: Stage) -> Result<ArtifactScan> {
        let spec = self.catalog.get(stage);
        let path = spec.artifact_path(&item.output_dir);
        match &spec.artifact {
            ArtifactKind::Lines { .. } => scan_lines(&path),
            ArtifactKind::Files { extension, .. } => scan_dir(&path, extension),
        }
    }
}

fn scan_lines(path: &Path) -> Result<ArtifactScan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArtifactScan::default()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let newest = file.metadata().and_then(|m| m.modified()).ok();

    // Scraped records are not always valid UTF-8; count raw lines.
    let mut count = 0;
    for line in BufReader::new(file).split(b'\n') {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if !line.iter().all(u8::is_ascii_whitespace) {
            count += 1;
        }
    }
    Ok(ArtifactScan {
        exists: true,
        count,
        newest,
    })
}

fn scan_dir(path: &Path, extension: &str) -> Result<ArtifactScan> {
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArtifactScan::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", path.display()));
        }
    };

    let mut scan = ArtifactScan {
        exists: true,
        ..Default::default()
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", path.display()))?;
        let file_path = entry.path();
        if !file_path.is_file()
            || file_path.extension().and_then(|e| e.to_str()) != Some(extension)
        {
            continue;
        }
        scan.count += 1;
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            scan.newest = Some(scan.newest.map_or(modified, |n| n.max(modified)));
        }
    }
    Ok(scan)
}
