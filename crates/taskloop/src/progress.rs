//! Progress observers: structured logs and the TSV report.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use taskloop_core::{ProgressObserver, ReportRow, ReportWriter, RunEvent};
use tracing::{info, warn};

/// Logs every progress event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &RunEvent<'_>) {
        match event {
            RunEvent::IterationStarted { iteration } => {
                info!(iteration, "iteration started");
            }
            RunEvent::StepStarted { progress } => {
                info!(
                    iteration = progress.iteration,
                    step = %progress.step,
                    position = progress.position,
                    total = progress.total,
                    retry = progress.retry,
                    max_retries = progress.max_retries,
                    "step started"
                );
            }
            RunEvent::StepFinished { progress, record } => {
                info!(
                    iteration = progress.iteration,
                    step = %record.step,
                    gate = record.gate.map_or("-", |g| g.as_str()),
                    cost_usd = record.cost_usd,
                    retry = record.retry_count,
                    "step finished"
                );
            }
            RunEvent::GateRetriesExhausted {
                iteration,
                step,
                attempts,
            } => {
                warn!(iteration, step, attempts, "gate retries exhausted");
            }
            RunEvent::VerificationFinished { iteration, result } => {
                info!(
                    iteration,
                    verified = result.verified,
                    unchecked = result.unchecked,
                    checked = result.checked,
                    "verification result"
                );
            }
            RunEvent::VerificationFailed { iteration, error } => {
                warn!(iteration, error, "verification failed; continuing");
            }
            RunEvent::QueueMerged { iteration, files } => {
                info!(iteration, count = files.len(), "merged queued files");
            }
            RunEvent::IterationFinished { state } => {
                info!(
                    iteration = state.iteration,
                    total_cost = state.total_cost,
                    tokens = state.total_tokens(),
                    "iteration finished"
                );
            }
            RunEvent::RunFinished { state, error } => match error {
                None => info!(
                    iterations = state.iteration,
                    total_cost = state.total_cost,
                    elapsed_sec = state.elapsed_secs(),
                    "run completed"
                ),
                Some(error) => warn!(
                    iterations = state.iteration,
                    total_cost = state.total_cost,
                    elapsed_sec = state.elapsed_secs(),
                    error,
                    "run stopped"
                ),
            },
        }
    }
}

/// Appends a row per progress event to `report.tsv`.
#[derive(Debug)]
pub struct ReportObserver {
    writer: Mutex<ReportWriter>,
}

impl ReportObserver {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            writer: Mutex::new(ReportWriter::new(path)?),
        })
    }
}

impl ProgressObserver for ReportObserver {
    fn on_event(&self, event: &RunEvent<'_>) {
        let row = ReportRow::from_event(Utc::now().timestamp_millis(), event);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // Flush per row so the report is readable while the run is in progress.
        if let Err(err) = writer.write_row(&row).and_then(|()| writer.flush()) {
            warn!(error = %err, "failed to write report row");
        }
    }
}
