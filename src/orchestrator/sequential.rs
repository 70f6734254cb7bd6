//! `run <max_iterations>`: one controller iteration at a time.
//!
//! Each iteration tries the stages downstream-first, so items already in the
//! pipeline are finished before new ones are started.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Engine, IterationOutcome, SessionSummary, StageController};
use crate::stage::Stage;

pub async fn run_sequential(
    engine: Arc<Engine>,
    max_iterations: u32,
    cancel: CancellationToken,
) -> Result<SessionSummary> {
    let start = Instant::now();
    let controllers: Vec<StageController> = Stage::ALL
        .iter()
        .rev()
        .map(|s| StageController::new(engine.clone(), *s))
        .collect();

    let mut iterations = 0;
    let mut interrupted = false;

    'session: while iterations < max_iterations {
        let mut worked = false;
        for controller in &controllers {
            let report = tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break 'session;
                }
                report = controller.run_once() => report?,
            };
            if report.outcome == IterationOutcome::NoWork {
                continue;
            }

            iterations += 1;
            worked = true;
            if let Some(ui) = &engine.ui {
                ui.iteration(iterations, max_iterations, &report);
            }
            break;
        }
        if !worked {
            tracing::info!(iterations, "No selectable work left");
            break;
        }
    }

    if interrupted {
        tracing::warn!(iterations, "Run interrupted");
    }
    SessionSummary::collect(&engine.registry, iterations, start.elapsed(), interrupted)
}
