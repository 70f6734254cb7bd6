use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

use crate::registry::{ItemStatus, Registry};

/// End-of-session counts shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub iterations: u32,
    pub completed: usize,
    pub blocked: usize,
    /// Pending or in progress
    pub remaining: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl SessionSummary {
    pub fn collect(
        registry: &Registry,
        iterations: u32,
        elapsed: Duration,
        interrupted: bool,
    ) -> Result<Self> {
        let mut summary = SessionSummary {
            iterations,
            elapsed,
            interrupted,
            ..Default::default()
        };
        for item in registry.list()? {
            match item.status {
                ItemStatus::Completed => summary.completed += 1,
                ItemStatus::Blocked => summary.blocked += 1,
                ItemStatus::Skip => summary.skipped += 1,
                ItemStatus::Pending | ItemStatus::InProgress => summary.remaining += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkItem;
    use tempfile::tempdir;

    #[test]
    fn test_collect_counts_by_status() {
        let dir = tempdir().unwrap();
        let registry = Registry::open_or_create(dir.path().join("sources.json")).unwrap();
        for (id, status) in [
            ("a", ItemStatus::Completed),
            ("b", ItemStatus::Blocked),
            ("c", ItemStatus::Pending),
            ("d", ItemStatus::InProgress),
            ("e", ItemStatus::Skip),
        ] {
            let mut item = WorkItem::new(id, id, "https://x.test", dir.path());
            item.status = status;
            registry.insert(item).unwrap();
        }

        let summary =
            SessionSummary::collect(&registry, 7, Duration::from_secs(3), false).unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.remaining, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.iterations, 7);
    }
}
