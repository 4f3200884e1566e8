//! Core types shared by the loop driver and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses `UUIDv7` so persisted runs sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Mutable accumulator for one full run.
///
/// Owned exclusively by the driver for the duration of a run call and handed
/// back to the caller (inside the error on failure). Cumulative counters never
/// decrease; `iteration` is 1-indexed once the first iteration starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    pub run_id: Id,
    pub iteration: u32,
    pub total_cost: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub start_time: DateTime<Utc>,
    pub last_output: String,
    pub completed: bool,
    /// Display form of the error that ended the run, if any.
    pub terminal_error: Option<String>,
}

impl IterationState {
    pub fn new() -> Self {
        Self {
            run_id: Id::new(),
            iteration: 0,
            total_cost: 0.0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            start_time: Utc::now(),
            last_output: String::new(),
            completed: false,
            terminal_error: None,
        }
    }

    /// Add one execution's spend to the running totals.
    pub fn record(&mut self, cost_usd: f64, tokens_in: u64, tokens_out: u64) {
        self.total_cost += cost_usd;
        self.total_tokens_in += tokens_in;
        self.total_tokens_out += tokens_out;
    }

    /// Add a full execution outcome, including its output.
    pub fn record_outcome(&mut self, outcome: &ExecutionOutcome) {
        self.record(outcome.cost_usd, outcome.tokens_in, outcome.tokens_out);
        self.last_output.clone_from(&outcome.output);
    }

    /// Add the spend of a verification call.
    ///
    /// The verifier reports a single token count; it is booked as output tokens.
    pub fn record_verification(&mut self, result: &VerificationResult) {
        self.record(result.cost, 0, result.tokens);
    }

    /// Whether cumulative spend has reached the budget. Equality counts.
    pub fn budget_exhausted(&self, max_budget: f64) -> bool {
        self.total_cost >= max_budget
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens_in + self.total_tokens_out
    }

    /// Seconds since the run started.
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}

impl Default for IterationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one agent invocation as reported by the execution collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: String,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl ExecutionOutcome {
    pub fn new(output: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            output: output.into(),
            cost_usd,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

/// Outcome of classifying a gate step's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResult {
    NotFound,
    Passed,
    Failed,
}

impl GateResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Sentinel count reported when a checker response could not be parsed.
pub const UNPARSEABLE_COUNT: i64 = -1;

/// Result of a verification call.
///
/// `unchecked == checked == -1` means the checker's response was unparseable,
/// which is distinct from a genuine incomplete result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub unchecked: i64,
    pub checked: i64,
    pub cost: f64,
    pub tokens: u64,
}

impl VerificationResult {
    pub fn is_unparseable(&self) -> bool {
        self.unchecked == UNPARSEABLE_COUNT && self.checked == UNPARSEABLE_COUNT
    }
}

/// Record of a single step execution inside a gated workflow pass.
///
/// One is appended per execution, retries included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub output: String,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// `None` for non-gate steps.
    pub gate: Option<GateResult>,
    /// Failed attempts recorded for this step when the record was made.
    pub retry_count: u32,
}
