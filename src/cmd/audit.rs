//! `cascade audit [--fix]`: status reconciliation pass.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use cascade::config::Config;
use cascade::reconcile::audit;
use cascade::registry::Registry;
use cascade::ui::table::audit_summary;
use cascade::validator::OutputValidator;

pub fn cmd_audit(config: &Config, fix: bool) -> Result<()> {
    let registry = Registry::open(&config.registry_path)?;
    let catalog = Arc::new(config.toml.catalog()?);
    let validator = OutputValidator::new(
        catalog,
        Duration::from_secs(config.toml.validator.max_age_secs),
    );

    let report = audit(&registry, &validator, fix)?;
    tracing::info!(
        checked = report.checked,
        mismatches = report.mismatches.len(),
        fixed = report.fixed,
        "Audit finished"
    );
    print!("{}", audit_summary(&report, fix));
    Ok(())
}
