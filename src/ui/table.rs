//! Plain-text tables for `status` and `audit`.

use console::style;

use crate::reconcile::AuditReport;
use crate::registry::{ItemStatus, StageProgress, WorkItem};
use crate::stage::Stage;

/// `produced/discovered` plus a verified or blocked marker.
fn stage_cell(p: &StageProgress) -> String {
    let marker = if p.status == ItemStatus::Blocked {
        "!"
    } else if p.is_verified() {
        "*"
    } else {
        ""
    };
    format!("{}/{}{}", p.produced, p.discovered, marker)
}

fn status_style(status: ItemStatus, padded: String) -> String {
    match status {
        ItemStatus::Completed => style(padded).green().to_string(),
        ItemStatus::Blocked => style(padded).red().to_string(),
        ItemStatus::InProgress => style(padded).yellow().to_string(),
        ItemStatus::Pending | ItemStatus::Skip => style(padded).dim().to_string(),
    }
}

pub fn status_table(items: &[WorkItem]) -> String {
    let id_width = items.iter().map(|i| i.id.len()).max().unwrap_or(2).max(2);
    let mut out = format!(
        "{:<id_width$}  {:<11}  {:>5}",
        "ID",
        "STATUS",
        "PRIO",
        id_width = id_width
    );
    for stage in Stage::ALL {
        out.push_str(&format!("  {:>12}", stage.as_str().to_uppercase()));
    }
    out.push('\n');

    for item in items {
        out.push_str(&format!("{:<id_width$}  ", item.id, id_width = id_width));
        out.push_str(&status_style(item.status, format!("{:<11}", item.status)));
        out.push_str(&format!("  {:>5}", item.priority));
        for stage in Stage::ALL {
            out.push_str(&format!("  {:>12}", stage_cell(&item.stage(stage))));
        }
        out.push('\n');
    }

    let count = |s: ItemStatus| items.iter().filter(|i| i.status == s).count();
    out.push_str(&format!(
        "\n{} items: {} completed, {} in progress, {} pending, {} blocked, {} skipped\n",
        items.len(),
        count(ItemStatus::Completed),
        count(ItemStatus::InProgress),
        count(ItemStatus::Pending),
        count(ItemStatus::Blocked),
        count(ItemStatus::Skip),
    ));
    out.push_str(&format!(
        "{}\n",
        style("counts are produced/discovered; * verified, ! blocked").dim()
    ));
    out
}

pub fn audit_summary(report: &AuditReport, fixed_requested: bool) -> String {
    let mut out = format!("Checked {} items\n", report.checked);
    if report.mismatches.is_empty() {
        out.push_str("No status drift found\n");
    }
    for m in &report.mismatches {
        let note = if !m.fixable {
            " (terminal, report only)"
        } else if fixed_requested {
            " (fixed)"
        } else {
            ""
        };
        out.push_str(&format!(
            "  {}: recorded {} derived {}{}\n",
            m.item_id, m.recorded, m.derived, note
        ));
    }
    for (item, violations) in &report.invariant_violations {
        for v in violations {
            out.push_str(&format!("  {} {}: {}\n", style("invariant").red(), item, v));
        }
    }
    if fixed_requested {
        out.push_str(&format!("Fixed {} items\n", report.fixed));
    } else if report.mismatches.iter().any(|m| m.fixable) {
        out.push_str("Run with --fix to write corrections\n");
    }
    out
}
