use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::executor::{ExecutionOutcome, Signal};
use crate::orchestrator::{IterationOutcome, IterationReport, SessionSummary};
use crate::pipeline::{PipelineReport, StartReason, WorkerExit};
use crate::stage::Stage;
use crate::ui::icons::{
    BLOCKER, CHECK, CLOCK, CROSS, QUESTION, RETRY, RUNNING, SPARKLE, STOP, TRIGGER, WARN,
};

/// Terminal UI for a run, rendered via `indicatif`.
///
/// One spinner per in-flight executor invocation, keyed by item and stage,
/// so the cascade mode can show several stages at once. Event lines are
/// printed above the spinners.
pub struct RunUI {
    multi: MultiProgress,
    spinners: Mutex<HashMap<(String, Stage), ProgressBar>>,
    verbose: bool,
}

impl RunUI {
    pub fn new(verbose: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            spinners: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_invocation(&self, item_id: &str, stage: Stage, attempt: u32) {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix(format!("{}/{}", item_id, stage));
        bar.set_message(format!("attempt {}", style(attempt).cyan()));
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut spinners) = self.spinners.lock()
            && let Some(old) = spinners.insert((item_id.to_string(), stage), bar)
        {
            old.finish_and_clear();
        }
    }

    /// Latest tool use or text from the executor.
    pub fn show_activity(&self, item_id: &str, stage: Stage, activity: &str) {
        if let Ok(spinners) = self.spinners.lock()
            && let Some(bar) = spinners.get(&(item_id.to_string(), stage))
        {
            bar.set_message(style(activity).yellow().to_string());
        }
        if self.verbose {
            self.print_line(format!("    {} {}", style("\u{2192}").dim(), style(activity).dim()));
        }
    }

    pub fn finish_invocation(&self, item_id: &str, stage: Stage, outcome: Option<&ExecutionOutcome>) {
        if let Ok(mut spinners) = self.spinners.lock()
            && let Some(bar) = spinners.remove(&(item_id.to_string(), stage))
        {
            bar.finish_and_clear();
        }
        let Some(outcome) = outcome else {
            return;
        };
        let signal = match outcome.signal {
            Signal::Completed => style(outcome.signal.as_str()).green(),
            Signal::Blocked => style(outcome.signal.as_str()).red(),
            Signal::None => style(outcome.signal.as_str()).yellow(),
        };
        let timeout_note = if outcome.timed_out { " (timed out)" } else { "" };
        self.print_line(format!(
            "  {}{}/{} signal: {} in {}{}",
            CLOCK,
            item_id,
            stage,
            signal,
            format_duration(outcome.duration),
            timeout_note
        ));
    }

    /// One controller iteration finished with work done.
    pub fn iteration(&self, n: u32, max: u32, report: &IterationReport) {
        let item = report.item_id.as_deref().unwrap_or("-");
        let (icon, text) = match &report.outcome {
            IterationOutcome::Completed { count } => (
                CHECK,
                style(format!("verified, {} records", count)).green().to_string(),
            ),
            IterationOutcome::RetryRecovered { count } => (
                RETRY,
                style(format!("verified after retry, {} records", count))
                    .green()
                    .to_string(),
            ),
            IterationOutcome::Blocked => (BLOCKER, style("blocked").red().bold().to_string()),
            IterationOutcome::DependencyMissing => (
                BLOCKER,
                style("blocked: upstream artifact missing").red().bold().to_string(),
            ),
            IterationOutcome::Ambiguous => (
                QUESTION,
                style("no sentinel, will resume").yellow().to_string(),
            ),
            IterationOutcome::ValidationFailed { error } => {
                (WARN, style(format!("still invalid: {}", error)).yellow().to_string())
            }
            IterationOutcome::NoWork => (CLOCK, style("idle").dim().to_string()),
        };
        self.print_line(format!(
            "{} [{}/{}] {} {} {}",
            icon,
            style(n).cyan(),
            max,
            style(item).bold(),
            style(report.stage).dim(),
            text
        ));
    }

    pub fn stage_started(&self, item_id: &str, stage: Stage, reason: Option<StartReason>) {
        let why = match reason {
            None => "first pending stage",
            Some(StartReason::ThresholdCrossed) => "threshold reached",
            Some(StartReason::UpstreamFinished) => "upstream finished",
        };
        let icon = if reason.is_some() { TRIGGER } else { RUNNING };
        self.print_line(format!(
            "{}{} {} {}",
            icon,
            style(item_id).bold(),
            style(stage).yellow(),
            style(format!("({})", why)).dim()
        ));
    }

    pub fn stage_exited(&self, item_id: &str, stage: Stage, exit: WorkerExit) {
        let (icon, text) = match exit {
            WorkerExit::Finished => (CHECK, style("finished").green()),
            WorkerExit::Blocked => (BLOCKER, style("blocked").red()),
            WorkerExit::Cancelled => (STOP, style("cancelled").yellow()),
            WorkerExit::Exhausted => (WARN, style("iteration cap reached").yellow()),
        };
        self.print_line(format!(
            "{}{} {} {}",
            icon,
            style(item_id).bold(),
            style(stage).dim(),
            text
        ));
    }

    pub fn summary(&self, summary: &SessionSummary) {
        self.print_line("");
        self.print_line(format!("{}", style("\u{2550}".repeat(60)).cyan()));
        let headline = if summary.interrupted {
            format!("{}Run interrupted", STOP)
        } else {
            format!("{}Run finished", SPARKLE)
        };
        self.print_line(style(headline).bold().to_string());
        self.print_line(format!(
            "  {} {}   {} {}   {} {}   {} {}",
            style("iterations:").dim(),
            summary.iterations,
            style("completed:").dim(),
            style(summary.completed).green(),
            style("blocked:").dim(),
            style(summary.blocked).red(),
            style("remaining:").dim(),
            style(summary.remaining).yellow(),
        ));
        self.print_line(format!(
            "  {} {}",
            style("elapsed:").dim(),
            format_duration(summary.elapsed)
        ));
    }

    pub fn pipeline_reports(&self, reports: &[PipelineReport]) {
        for report in reports {
            let icon = match report.status {
                crate::registry::ItemStatus::Completed => CHECK,
                crate::registry::ItemStatus::Blocked => BLOCKER,
                _ if report.interrupted => STOP,
                _ => CROSS,
            };
            self.print_line(format!(
                "{}{} {} after {} iterations ({})",
                icon,
                style(&report.item_id).bold(),
                report.status,
                report.iterations,
                format_duration(report.elapsed)
            ));
        }
    }
}

/// `Xs`, or `Xm Ys` from one minute up.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_spinner_lifecycle() {
        let ui = RunUI::new(false);
        ui.start_invocation("acme", Stage::Discovery, 1);
        ui.show_activity("acme", Stage::Discovery, "Read: urls.jsonl");
        assert_eq!(ui.spinners.lock().unwrap().len(), 1);
        ui.finish_invocation("acme", Stage::Discovery, None);
        assert!(ui.spinners.lock().unwrap().is_empty());
    }
}
