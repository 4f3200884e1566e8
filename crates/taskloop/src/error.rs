//! Terminal outcomes of a loop run.

use taskloop_core::prompt::PromptError;
use taskloop_core::{IterationState, WorkflowError};
use thiserror::Error;

use crate::executor::ExecError;
use crate::state::StoreError;

/// Why a run stopped without completing.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("budget exceeded: spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded { spent: f64, limit: f64 },
    #[error("max iterations reached ({0})")]
    MaxIterationsReached(u32),
    #[error("step {step}: gate not passed after {attempts} attempts")]
    MaxGateRetriesExceeded { step: String, attempts: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("agent execution failed: {0}")]
    Exec(#[source] ExecError),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ExecError> for LoopError {
    /// A call killed by cancellation is reported as the cancellation itself.
    fn from(err: ExecError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Exec(err)
        }
    }
}

impl LoopError {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MaxIterationsReached(_) => 2,
            Self::BudgetExceeded { .. } => 3,
            Self::MaxGateRetriesExceeded { .. } => 4,
            Self::Cancelled => 130,
            Self::InvalidWorkflow(_) | Self::Prompt(_) | Self::Exec(_) | Self::Store(_) => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A failed run: the terminal outcome plus the state accumulated so far.
#[derive(Debug, Error)]
#[error("{kind} (iteration {}, ${:.4} spent)", .state.iteration, .state.total_cost)]
pub struct RunError {
    pub state: Box<IterationState>,
    #[source]
    pub kind: LoopError,
}

impl RunError {
    pub fn new(state: IterationState, kind: LoopError) -> Self {
        Self {
            state: Box::new(state),
            kind,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

pub type RunResult = std::result::Result<IterationState, RunError>;
