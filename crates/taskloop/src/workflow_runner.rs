//! One pass through a gated workflow.
//!
//! The runner walks steps by index. Gate steps that fail (or emit no verdict)
//! either jump to their `on_fail` target or retry in place, until the step's
//! failure count reaches the workflow's retry limit. Retry counters live only
//! for the duration of one [`WorkflowRunner::run_pass`] call.

use std::collections::HashMap;

use taskloop_core::gate::GateClassifier;
use taskloop_core::prompt::{render, PromptContext};
use taskloop_core::{
    GateResult, IterationState, ProgressObserver, RunEvent, StepProgress, StepRecord, Workflow,
    WorkflowError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LoopError;
use crate::executor::Executor;

/// Terminal state of a pass.
#[derive(Debug)]
pub enum PassOutcome {
    AllStepsCompleted,
    Aborted(LoopError),
}

/// Everything one pass produced.
#[derive(Debug)]
pub struct PassReport {
    /// One record per execution, retries included.
    pub records: Vec<StepRecord>,
    pub outcome: PassOutcome,
}

impl PassReport {
    /// Outputs of every executed step, joined by newlines.
    pub fn combined_output(&self) -> String {
        self.records
            .iter()
            .map(|r| r.output.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, PassOutcome::AllStepsCompleted)
    }
}

/// Where the cursor goes after a step execution.
enum Transition {
    Advance,
    Jump(usize),
    Retry,
    Exhausted(u32),
}

/// Executes workflow passes against an executor.
pub struct WorkflowRunner<'a> {
    executor: &'a dyn Executor,
    classifier: &'a GateClassifier,
    observer: &'a dyn ProgressObserver,
}

impl std::fmt::Debug for WorkflowRunner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        classifier: &'a GateClassifier,
        observer: &'a dyn ProgressObserver,
    ) -> Self {
        Self {
            executor,
            classifier,
            observer,
        }
    }

    /// Run `workflow` once from its first step, adding spend to `state`.
    ///
    /// `workflow` must already be validated. Steps flagged `deferred` are
    /// executed like any other step when forward traversal reaches them.
    pub async fn run_pass(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        ctx: &PromptContext,
        state: &mut IterationState,
    ) -> PassReport {
        let steps = &workflow.steps;
        let max_retries = workflow.effective_max_gate_retries();
        let mut retries: HashMap<&str, u32> = HashMap::new();
        let mut records = Vec::new();
        let mut index = 0;

        let abort = |records, err| PassReport {
            records,
            outcome: PassOutcome::Aborted(err),
        };

        while let Some(step) = steps.get(index) {
            if cancel.is_cancelled() {
                return abort(records, LoopError::Cancelled);
            }

            let retry = retries.get(step.name.as_str()).copied().unwrap_or(0);
            let progress = StepProgress {
                iteration: state.iteration,
                step: step.name.clone(),
                position: index + 1,
                total: steps.len(),
                retry,
                max_retries,
            };
            self.observer.on_event(&RunEvent::StepStarted {
                progress: &progress,
            });

            let prompt = match render(&step.prompt, &ctx.for_step(&step.name)) {
                Ok(prompt) => prompt,
                Err(err) => return abort(records, err.into()),
            };

            debug!(step = %step.name, index, retry, "executing step");
            let outcome = match self.executor.execute(cancel, &prompt).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(partial) = err.partial() {
                        state.record(partial.cost_usd, partial.tokens_in, partial.tokens_out);
                    }
                    return abort(records, err.into());
                }
            };
            state.record_outcome(&outcome);

            let gate = step
                .gate
                .then(|| self.classifier.check_gate(&outcome.output));

            let transition = match gate {
                None | Some(GateResult::Passed) => Transition::Advance,
                Some(result) => {
                    let count = retries.entry(step.name.as_str()).or_insert(0);
                    *count += 1;
                    info!(
                        step = %step.name,
                        gate = result.as_str(),
                        attempts = *count,
                        max_retries,
                        "gate not passed"
                    );
                    if *count >= max_retries {
                        Transition::Exhausted(*count)
                    } else if let Some(target) = &step.on_fail {
                        match workflow.step_index(target) {
                            Some(target_index) => Transition::Jump(target_index),
                            None => {
                                return abort(
                                    records,
                                    WorkflowError::UnknownOnFailTarget {
                                        step: step.name.clone(),
                                        target: target.clone(),
                                    }
                                    .into(),
                                );
                            }
                        }
                    } else {
                        Transition::Retry
                    }
                }
            };

            let record = StepRecord {
                step: step.name.clone(),
                output: outcome.output,
                cost_usd: outcome.cost_usd,
                tokens_in: outcome.tokens_in,
                tokens_out: outcome.tokens_out,
                gate,
                retry_count: retry,
            };
            self.observer.on_event(&RunEvent::StepFinished {
                progress: &progress,
                record: &record,
            });
            records.push(record);

            match transition {
                Transition::Advance => {
                    if gate.is_some() {
                        info!(step = %step.name, "gate passed");
                    }
                    index += 1;
                }
                Transition::Jump(target_index) => {
                    debug!(
                        from = %step.name,
                        to = %steps[target_index].name,
                        "jumping to on_fail target"
                    );
                    index = target_index;
                }
                Transition::Retry => {}
                Transition::Exhausted(attempts) => {
                    warn!(step = %step.name, attempts, "max gate retries exceeded");
                    self.observer.on_event(&RunEvent::GateRetriesExhausted {
                        iteration: state.iteration,
                        step: &step.name,
                        attempts,
                    });
                    return abort(
                        records,
                        LoopError::MaxGateRetriesExceeded {
                            step: step.name.clone(),
                            attempts,
                        },
                    );
                }
            }
        }

        PassReport {
            records,
            outcome: PassOutcome::AllStepsCompleted,
        }
    }
}
