//! Loop driver: execution mode dispatch, the gated outer loop, and the
//! completion protocol shared with the simple loop.
//!
//! The driver owns the [`IterationState`] for the duration of one run call.
//! Collaborators (executor, verifier, store, observer) are injected as trait
//! objects; the observer only ever sees shared references.

use std::path::PathBuf;
use std::sync::Arc;

use taskloop_core::completion::CompletionDetector;
use taskloop_core::gate::GateClassifier;
use taskloop_core::prompt::PromptContext;
use taskloop_core::{Config, IterationState, NoopObserver, ProgressObserver, RunEvent, Workflow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LoopError, RunError, RunResult};
use crate::executor::Executor;
use crate::state::RunStore;
use crate::verifier::Verifier;
use crate::workflow_runner::{PassOutcome, WorkflowRunner};

/// Termination budgets shared by both execution modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_iterations: u32,
    /// USD. Reaching it exactly stops the run.
    pub max_budget: f64,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_budget: config.max_budget,
        }
    }
}

/// What the completion protocol decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Verified with an empty queue: the run is done.
    Done,
    /// Not verified (or the verifier failed): keep going.
    Continue,
    /// Verified, but queued files were merged; carries the rebuilt prompt.
    Expanded(String),
}

pub struct Driver {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) observer: Arc<dyn ProgressObserver>,
    pub(crate) limits: Limits,
    pub(crate) detector: CompletionDetector,
    pub(crate) classifier: GateClassifier,
    task: String,
    resume: Option<IterationState>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("limits", &self.limits)
            .field("detector", &self.detector)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
        store: Arc<dyn RunStore>,
        limits: Limits,
    ) -> Self {
        Self {
            executor,
            verifier,
            store,
            observer: Arc::new(NoopObserver),
            limits,
            detector: CompletionDetector::default(),
            classifier: GateClassifier::default(),
            task: String::new(),
            resume: None,
        }
    }

    /// Driver with limits and signal strings taken from `config`.
    pub fn from_config(
        config: &Config,
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self::new(executor, verifier, store, Limits::from_config(config))
            .with_detector(config.completion_detector())
            .with_classifier(config.gate_classifier())
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_detector(mut self, detector: CompletionDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_classifier(mut self, classifier: GateClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Task text exposed to step templates as `{{ task }}`.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Continue from a saved state: iteration and spend counters carry over,
    /// and the limits apply to the cumulative totals.
    pub fn resume_from(mut self, state: IterationState) -> Self {
        self.resume = Some(state);
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Run `workflow`, choosing the execution mode by whether it has gates.
    ///
    /// Ungated workflows (including the default preset) run the simple loop
    /// over `prompt`; their step prompts are not used.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        prompt: &str,
        files: &[PathBuf],
    ) -> RunResult {
        let workflow = match workflow.clone().resolve() {
            Ok(workflow) => workflow,
            Err(err) => return Err(RunError::new(self.start_state(), err.into())),
        };

        if workflow.has_gates() {
            info!(workflow = %workflow.name, steps = workflow.steps.len(), "running gated workflow");
            self.run_gated_workflow(cancel, &workflow, files).await
        } else {
            info!(workflow = %workflow.name, "workflow has no gates; running simple loop");
            if let Err(err) = self.store.merge_files(files) {
                return Err(RunError::new(self.start_state(), err.into()));
            }
            self.run_simple_loop(cancel, prompt).await
        }
    }

    /// Run a gated workflow inside the outer iteration/budget loop.
    ///
    /// A pass that exhausts its gate retries is followed by a fresh pass; when
    /// that happens on the last allowed iteration the run ends with
    /// [`LoopError::MaxGateRetriesExceeded`].
    pub async fn run_gated_workflow(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        initial_files: &[PathBuf],
    ) -> RunResult {
        let mut state = self.start_state();

        let workflow = match workflow.clone().resolve() {
            Ok(workflow) => workflow,
            Err(err) => return Err(RunError::new(state, err.into())),
        };
        let result = match self.store.merge_files(initial_files) {
            Ok(()) => self.gated_loop(cancel, &workflow, &mut state).await,
            Err(err) => Err(err.into()),
        };
        self.finish(state, result)
    }

    async fn gated_loop(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        state: &mut IterationState,
    ) -> Result<(), LoopError> {
        let runner = WorkflowRunner::new(&*self.executor, &self.classifier, &*self.observer);

        while state.iteration < self.limits.max_iterations {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            state.iteration += 1;
            self.observer.on_event(&RunEvent::IterationStarted {
                iteration: state.iteration,
            });

            let ctx = self.prompt_context();
            let report = runner.run_pass(cancel, workflow, &ctx, state).await;
            state.last_output = report.combined_output();

            match report.outcome {
                PassOutcome::Aborted(LoopError::MaxGateRetriesExceeded { step, attempts }) => {
                    if state.iteration >= self.limits.max_iterations {
                        self.check_budget(state)?;
                        self.end_iteration(state);
                        return Err(LoopError::MaxGateRetriesExceeded { step, attempts });
                    }
                    warn!(
                        iteration = state.iteration,
                        step = %step,
                        attempts,
                        "pass aborted on gate retries; starting next pass"
                    );
                }
                PassOutcome::Aborted(err) => return Err(err),
                PassOutcome::AllStepsCompleted => {
                    self.check_budget(state)?;
                    // A completed pass is itself the completion claim.
                    if self.complete(cancel, state).await? == Completion::Done {
                        self.end_iteration(state);
                        return Ok(());
                    }
                }
            }

            self.check_budget(state)?;
            self.end_iteration(state);
        }

        Err(LoopError::MaxIterationsReached(self.limits.max_iterations))
    }

    /// Verify a completion claim and consult the queue.
    ///
    /// Verifier spend is added to `state` whether or not verification works.
    /// A verifier failure lets the loop continue, unless it was cancelled.
    pub(crate) async fn complete(
        &self,
        cancel: &CancellationToken,
        state: &mut IterationState,
    ) -> Result<Completion, LoopError> {
        let files = self.store.files();
        info!(iteration = state.iteration, files = files.len(), "completion claimed; verifying");

        match self.verifier.verify(cancel, &files).await {
            Ok(result) => {
                state.record_verification(&result);
                self.observer.on_event(&RunEvent::VerificationFinished {
                    iteration: state.iteration,
                    result: &result,
                });
                if !result.verified {
                    return Ok(Completion::Continue);
                }
            }
            Err(err) => {
                let (cost, tokens) = err.partial_cost();
                state.record(cost, 0, tokens);
                let message = err.to_string();
                self.observer.on_event(&RunEvent::VerificationFailed {
                    iteration: state.iteration,
                    error: &message,
                });
                if err.is_cancelled() {
                    return Err(LoopError::Cancelled);
                }
                return Ok(Completion::Continue);
            }
        }

        let queued = self.store.pop_queue()?;
        if queued.is_empty() {
            return Ok(Completion::Done);
        }

        self.store.merge_files(&queued)?;
        self.observer.on_event(&RunEvent::QueueMerged {
            iteration: state.iteration,
            files: &queued,
        });
        Ok(Completion::Expanded(self.store.rebuild_prompt()?))
    }

    pub(crate) fn check_budget(&self, state: &IterationState) -> Result<(), LoopError> {
        if state.budget_exhausted(self.limits.max_budget) {
            return Err(LoopError::BudgetExceeded {
                spent: state.total_cost,
                limit: self.limits.max_budget,
            });
        }
        Ok(())
    }

    pub(crate) fn start_state(&self) -> IterationState {
        match &self.resume {
            Some(saved) => {
                let mut state = saved.clone();
                state.completed = false;
                state.terminal_error = None;
                state
            }
            None => IterationState::new(),
        }
    }

    /// Persist and report the end of an iteration.
    pub(crate) fn end_iteration(&self, state: &IterationState) {
        self.persist(state);
        self.observer
            .on_event(&RunEvent::IterationFinished { state });
    }

    /// Turn the loop result into the run result, persisting the final state.
    pub(crate) fn finish(
        &self,
        mut state: IterationState,
        result: Result<(), LoopError>,
    ) -> RunResult {
        match result {
            Ok(()) => {
                state.completed = true;
                state.terminal_error = None;
                self.persist(&state);
                self.observer.on_event(&RunEvent::RunFinished {
                    state: &state,
                    error: None,
                });
                Ok(state)
            }
            Err(kind) => {
                let message = kind.to_string();
                state.completed = false;
                state.terminal_error = Some(message.clone());
                self.persist(&state);
                self.observer.on_event(&RunEvent::RunFinished {
                    state: &state,
                    error: Some(&message),
                });
                Err(RunError::new(state, kind))
            }
        }
    }

    fn persist(&self, state: &IterationState) {
        if let Err(err) = self.store.save_state(state) {
            warn!(error = %err, "failed to save run state");
        }
    }

    fn prompt_context(&self) -> PromptContext {
        PromptContext::new(self.task.as_str(), &self.store.files())
            .with_promise(self.detector.promise())
            .with_gate_tags(self.classifier.pass_tag(), self.classifier.fail_tag())
    }
}
