//! Simple iteration loop: one prompt, repeated until verified completion.

use taskloop_core::{IterationState, RunEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::driver::{Completion, Driver};
use crate::error::{LoopError, RunResult};

impl Driver {
    /// Repeat `prompt` until the agent claims completion, the claim is
    /// verified, and the queue is empty.
    ///
    /// Stops early on budget exhaustion (equality counts), executor failure,
    /// or cancellation. Queued files merged after a verified claim rebuild the
    /// prompt and the loop continues.
    pub async fn run_simple_loop(&self, cancel: &CancellationToken, prompt: &str) -> RunResult {
        let mut state = self.start_state();
        let result = self.simple_loop(cancel, prompt, &mut state).await;
        self.finish(state, result)
    }

    async fn simple_loop(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        state: &mut IterationState,
    ) -> Result<(), LoopError> {
        let mut prompt = prompt.to_string();

        while state.iteration < self.limits.max_iterations {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            state.iteration += 1;
            self.observer.on_event(&RunEvent::IterationStarted {
                iteration: state.iteration,
            });

            match self.executor.execute(cancel, &prompt).await {
                Ok(outcome) => state.record_outcome(&outcome),
                Err(err) => {
                    if let Some(partial) = err.partial() {
                        state.record(partial.cost_usd, partial.tokens_in, partial.tokens_out);
                        state.last_output.clone_from(&partial.output);
                    }
                    return Err(err.into());
                }
            }

            self.check_budget(state)?;

            if self.detector.check(&state.last_output) {
                match self.complete(cancel, state).await? {
                    Completion::Done => {
                        self.end_iteration(state);
                        return Ok(());
                    }
                    Completion::Expanded(rebuilt) => {
                        info!(
                            iteration = state.iteration,
                            "queue merged; continuing with rebuilt prompt"
                        );
                        prompt = rebuilt;
                    }
                    Completion::Continue => {}
                }
            } else {
                debug!(iteration = state.iteration, "no completion promise in output");
            }

            self.end_iteration(state);
        }

        Err(LoopError::MaxIterationsReached(self.limits.max_iterations))
    }
}
