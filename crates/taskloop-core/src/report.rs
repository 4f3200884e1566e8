//! Report TSV generation.
//!
//! One row per progress event, appended to `report.tsv` in the state
//! directory so spend and gate behavior can be analysed after a run.
//!
//! Columns: `timestamp_ms`, kind, iteration, step, `cost_usd`, `tokens_in`,
//!          `tokens_out`, message

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::events::RunEvent;

/// A single row in the report.tsv file.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Event kind (e.g., `ITERATION_FINISHED`).
    pub kind: String,
    pub iteration: u32,
    pub step: String,
    /// Cost in USD: per step for step rows, cumulative for iteration/run rows.
    pub cost_usd: Option<f64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub message: String,
}

impl ReportRow {
    /// Create a new report row with required fields.
    pub fn new(timestamp_ms: i64, kind: impl Into<String>, iteration: u32) -> Self {
        Self {
            timestamp_ms,
            kind: kind.into(),
            iteration,
            step: String::new(),
            cost_usd: None,
            tokens_in: None,
            tokens_out: None,
            message: String::new(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn with_usage(mut self, cost_usd: f64, tokens_in: u64, tokens_out: u64) -> Self {
        self.cost_usd = Some(cost_usd);
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Build the row describing a progress event.
    pub fn from_event(timestamp_ms: i64, event: &RunEvent<'_>) -> Self {
        let row = Self::new(timestamp_ms, event.event_type().as_str(), event.iteration());
        match event {
            RunEvent::IterationStarted { .. } => row,
            RunEvent::StepStarted { progress } => row.with_step(&progress.step).with_message(
                format!(
                    "step {}/{} retry {}/{}",
                    progress.position, progress.total, progress.retry, progress.max_retries
                ),
            ),
            RunEvent::StepFinished { progress, record } => {
                let gate = record.gate.map_or("-", |g| g.as_str());
                row.with_step(&progress.step)
                    .with_usage(record.cost_usd, record.tokens_in, record.tokens_out)
                    .with_message(format!("gate={gate} retry={}", record.retry_count))
            }
            RunEvent::GateRetriesExhausted { step, attempts, .. } => row
                .with_step(*step)
                .with_message(format!("attempts={attempts}")),
            RunEvent::VerificationFinished { result, .. } => row
                .with_usage(result.cost, 0, result.tokens)
                .with_message(format!(
                    "verified={} unchecked={} checked={}",
                    result.verified, result.unchecked, result.checked
                )),
            RunEvent::VerificationFailed { error, .. } => row.with_message(*error),
            RunEvent::QueueMerged { files, .. } => row.with_message(
                files
                    .iter()
                    .map(|f| f.display().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            RunEvent::IterationFinished { state } => row.with_usage(
                state.total_cost,
                state.total_tokens_in,
                state.total_tokens_out,
            ),
            RunEvent::RunFinished { state, error } => row
                .with_usage(state.total_cost, state.total_tokens_in, state.total_tokens_out)
                .with_message(error.unwrap_or("completed")),
        }
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        let cost = self.cost_usd.map(|c| format!("{c:.6}")).unwrap_or_default();
        let tokens_in = self.tokens_in.map(|t| t.to_string()).unwrap_or_default();
        let tokens_out = self.tokens_out.map(|t| t.to_string()).unwrap_or_default();

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind,
            self.iteration,
            sanitize_field(&self.step),
            cost,
            tokens_in,
            tokens_out,
            sanitize_field(&self.message),
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str = "timestamp_ms\tkind\titeration\tstep\tcost_usd\ttokens_in\ttokens_out\tmessage";

/// Writer for report.tsv files.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Create a new report writer, writing header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    /// Write a single report row.
    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())
    }

    /// Flush pending writes.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
