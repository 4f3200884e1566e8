//! Progress events emitted by the loop driver.
//!
//! Observers receive borrowed views of driver state and return nothing, so
//! they can report progress but cannot steer the run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{IterationState, StepRecord, VerificationResult};

/// Event type names, used as the `kind` column of the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    IterationStarted,
    StepStarted,
    StepFinished,
    GateRetriesExhausted,
    VerificationFinished,
    VerificationFailed,
    QueueMerged,
    IterationFinished,
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IterationStarted => "ITERATION_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::GateRetriesExhausted => "GATE_RETRIES_EXHAUSTED",
            Self::VerificationFinished => "VERIFICATION_FINISHED",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::QueueMerged => "QUEUE_MERGED",
            Self::IterationFinished => "ITERATION_FINISHED",
            Self::RunFinished => "RUN_FINISHED",
        }
    }
}

/// Position of a workflow step within the current pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Outer iteration the pass belongs to.
    pub iteration: u32,
    pub step: String,
    /// 1-based position of the step.
    pub position: usize,
    pub total: usize,
    /// Failed gate attempts so far for this step.
    pub retry: u32,
    pub max_retries: u32,
}

/// A single progress notification.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    IterationStarted {
        iteration: u32,
    },
    StepStarted {
        progress: &'a StepProgress,
    },
    StepFinished {
        progress: &'a StepProgress,
        record: &'a StepRecord,
    },
    GateRetriesExhausted {
        iteration: u32,
        step: &'a str,
        attempts: u32,
    },
    VerificationFinished {
        iteration: u32,
        result: &'a VerificationResult,
    },
    VerificationFailed {
        iteration: u32,
        error: &'a str,
    },
    QueueMerged {
        iteration: u32,
        files: &'a [PathBuf],
    },
    IterationFinished {
        state: &'a IterationState,
    },
    RunFinished {
        state: &'a IterationState,
        /// Display form of the terminal error, `None` on success.
        error: Option<&'a str>,
    },
}

impl RunEvent<'_> {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::IterationStarted { .. } => EventType::IterationStarted,
            Self::StepStarted { .. } => EventType::StepStarted,
            Self::StepFinished { .. } => EventType::StepFinished,
            Self::GateRetriesExhausted { .. } => EventType::GateRetriesExhausted,
            Self::VerificationFinished { .. } => EventType::VerificationFinished,
            Self::VerificationFailed { .. } => EventType::VerificationFailed,
            Self::QueueMerged { .. } => EventType::QueueMerged,
            Self::IterationFinished { .. } => EventType::IterationFinished,
            Self::RunFinished { .. } => EventType::RunFinished,
        }
    }

    /// Iteration the event belongs to.
    pub fn iteration(&self) -> u32 {
        match self {
            Self::IterationStarted { iteration }
            | Self::GateRetriesExhausted { iteration, .. }
            | Self::VerificationFinished { iteration, .. }
            | Self::VerificationFailed { iteration, .. }
            | Self::QueueMerged { iteration, .. } => *iteration,
            Self::StepStarted { progress } | Self::StepFinished { progress, .. } => {
                progress.iteration
            }
            Self::IterationFinished { state } | Self::RunFinished { state, .. } => state.iteration,
        }
    }
}

/// Receives progress notifications. Must not block for long: it is called
/// synchronously between agent invocations.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent<'_>);
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_event(&self, _event: &RunEvent<'_>) {}
}

impl ProgressObserver for Vec<Box<dyn ProgressObserver>> {
    fn on_event(&self, event: &RunEvent<'_>) {
        for observer in self {
            observer.on_event(event);
        }
    }
}
