//! Registry management: `add`, `status`, `unblock`, `skip`, `archive`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use cascade::checkpoint::CheckpointStore;
use cascade::config::Config;
use cascade::registry::{ItemStatus, Registry, WorkItem, sort_by_priority};
use cascade::stage::Stage;
use cascade::ui::icons::{CHECK, SPARKLE};
use cascade::ui::table::status_table;

pub fn cmd_add(
    config: &Config,
    id: &str,
    url: &str,
    name: Option<&str>,
    priority: i64,
    output_dir: Option<&Path>,
) -> Result<()> {
    if id.trim().is_empty() {
        anyhow::bail!("Item id must not be empty");
    }
    let registry = Registry::open_or_create(&config.registry_path)?;
    let output_dir = match output_dir {
        Some(dir) => config.resolve(dir),
        None => config.default_output_dir(id),
    };
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let item = WorkItem::new(id, name.unwrap_or(id), url, &output_dir).with_priority(priority);
    registry.insert(item)?;
    tracing::info!(item = %id, priority, "Item registered");
    println!(
        "{}Added {} (priority {}) -> {}",
        CHECK,
        style(id).bold(),
        priority,
        output_dir.display()
    );
    Ok(())
}

pub fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let registry = Registry::open(&config.registry_path)?;
    let mut items = registry.list()?;
    sort_by_priority(&mut items);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&items).context("Failed to serialize items")?
        );
        return Ok(());
    }
    if items.is_empty() {
        println!("No items registered. Add one with 'cascade add <id> <url>'.");
        return Ok(());
    }
    print!("{}", status_table(&items));
    Ok(())
}

pub fn cmd_unblock(config: &Config, id: &str, reset_checkpoint: bool) -> Result<()> {
    let registry = Registry::open(&config.registry_path)?;
    let current = registry.get(id)?;
    if current.status != ItemStatus::Blocked {
        println!("{} is {}, not blocked; nothing to do", id, current.status);
        return Ok(());
    }
    registry.update(id, |item| item.unblock())?;

    if reset_checkpoint {
        let store = CheckpointStore::new(&config.checkpoint_dir);
        for stage in Stage::ALL.into_iter().filter(|s| s.resumable()) {
            if store.reset(id, stage)? {
                println!("  removed {} checkpoint", stage);
            }
        }
    }
    tracing::info!(item = %id, reset_checkpoint, "Item unblocked");
    println!("{}{} returned to pending", CHECK, style(id).bold());
    Ok(())
}

pub fn cmd_skip(config: &Config, id: &str) -> Result<()> {
    let registry = Registry::open(&config.registry_path)?;
    registry.update(id, |item| item.status = ItemStatus::Skip)?;
    tracing::info!(item = %id, "Item parked");
    println!("{} will be skipped", style(id).bold());
    Ok(())
}

pub fn cmd_archive(config: &Config) -> Result<()> {
    let registry = Registry::open(&config.registry_path)?;
    let moved = registry.archive_completed()?;
    if moved.is_empty() {
        println!("No completed items to archive");
        return Ok(());
    }
    tracing::info!(count = moved.len(), "Archived completed items");
    println!(
        "{}Archived {} item(s) to {}",
        SPARKLE,
        moved.len(),
        registry.archive_path().display()
    );
    for id in moved {
        println!("  {}", id);
    }
    Ok(())
}
