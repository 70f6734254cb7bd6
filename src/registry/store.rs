//! Durable registry document with lock-guarded read-modify-write.
//!
//! The document lives in a single JSON file shaped `{version, sources: [...]}`.
//! Every mutation takes an exclusive advisory lock on a sidecar `.lock` file,
//! re-reads the document, applies the change, bumps `version` and writes the
//! result atomically. Several workers (tasks or processes) can therefore
//! share one registry without lost updates.

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::item::{ItemStatus, WorkItem};
use crate::errors::CascadeError;
use crate::stage::Stage;
use crate::util::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Bumped on every write
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub sources: Vec<WorkItem>,
}

impl RegistryDocument {
    fn find_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.sources.iter_mut().find(|i| i.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Releases the advisory lock when dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl Registry {
    /// Open an existing registry. A missing file is fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::at(path.into());
        if !registry.path.exists() {
            return Err(CascadeError::RegistryMissing {
                path: registry.path.clone(),
            }
            .into());
        }
        // Fail fast on a corrupt document.
        registry.load()?;
        Ok(registry)
    }

    /// Open a registry, creating an empty document if none exists.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let registry = Self::at(path.into());
        if !registry.path.exists() {
            let _lock = registry.lock()?;
            if !registry.path.exists() {
                registry.write(&RegistryDocument::default())?;
            }
        }
        registry.load()?;
        Ok(registry)
    }

    fn at(path: PathBuf) -> Self {
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file that receives archived items.
    pub fn archive_path(&self) -> PathBuf {
        self.path.with_file_name("archive.json")
    }

    /// Read the current document without taking the lock. Writers replace
    /// the file atomically, so a reader always sees a complete document.
    pub fn load(&self) -> Result<RegistryDocument> {
        read_document(&self.path)
    }

    pub fn list(&self) -> Result<Vec<WorkItem>> {
        Ok(self.load()?.sources)
    }

    pub fn get(&self, id: &str) -> Result<WorkItem> {
        self.load()?
            .sources
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| CascadeError::ItemNotFound { id: id.to_string() }.into())
    }

    /// Items automatic selection may run for `stage`, by priority then id.
    pub fn list_selectable(&self, stage: Stage) -> Result<Vec<WorkItem>> {
        let mut items: Vec<WorkItem> = self
            .list()?
            .into_iter()
            .filter(|i| i.is_selectable_for(stage))
            .collect();
        sort_by_priority(&mut items);
        Ok(items)
    }

    pub fn insert(&self, item: WorkItem) -> Result<()> {
        self.transact(|doc| {
            if doc.sources.iter().any(|i| i.id == item.id) {
                anyhow::bail!("Item {} already exists in registry", item.id);
            }
            doc.sources.push(item);
            Ok(((), true))
        })
    }

    /// Apply `mutator` to one item atomically and return the stored result.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<WorkItem>
    where
        F: FnOnce(&mut WorkItem),
    {
        self.transact(|doc| {
            let item = doc
                .find_mut(id)
                .ok_or_else(|| CascadeError::ItemNotFound { id: id.to_string() })?;
            let before = item.clone();
            mutator(item);
            let changed = *item != before;
            if changed {
                item.updated_at = Utc::now();
            }
            Ok((item.clone(), changed))
        })
    }

    /// Apply a batch mutation to every item. The closure reports whether it
    /// changed anything; nothing is written otherwise.
    pub fn update_all<T, F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<WorkItem>) -> (T, bool),
    {
        self.transact(|doc| Ok(mutator(&mut doc.sources)))
    }

    /// Move completed items to the archive document. Returns the moved ids.
    pub fn archive_completed(&self) -> Result<Vec<String>> {
        let archive_path = self.archive_path();
        self.transact(|doc| {
            let (done, active): (Vec<WorkItem>, Vec<WorkItem>) = std::mem::take(&mut doc.sources)
                .into_iter()
                .partition(|i| i.status == ItemStatus::Completed);
            doc.sources = active;
            if done.is_empty() {
                return Ok((Vec::new(), false));
            }

            let mut archive = if archive_path.exists() {
                read_document(&archive_path)?
            } else {
                RegistryDocument::default()
            };
            let ids = done.iter().map(|i| i.id.clone()).collect();
            archive.sources.extend(done);
            archive.version += 1;
            let json = serde_json::to_string_pretty(&archive)
                .context("Failed to serialize archive")?;
            // The archive is written first: a crash in between leaves the
            // items in both documents rather than in neither.
            write_atomic(&archive_path, json.as_bytes())?;
            Ok((ids, true))
        })
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<(T, bool)>,
    {
        let _lock = self.lock()?;
        let mut doc = self.load()?;
        let (value, changed) = f(&mut doc)?;
        if changed {
            doc.version += 1;
            self.write(&doc)?;
        }
        Ok(value)
    }

    fn lock(&self) -> Result<LockGuard> {
        if let Some(dir) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.lock_path.display()))?;
        Ok(LockGuard(file))
    }

    fn write(&self, doc: &RegistryDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc).context("Failed to serialize registry")?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Sort by priority (lower first) then id.
pub fn sort_by_priority(items: &mut [WorkItem]) {
    items.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

fn read_document(path: &Path) -> Result<RegistryDocument> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CascadeError::RegistryMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&content).map_err(|e| {
        CascadeError::RegistryCorruption {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}
