//! Scripted collaborators for driver tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use taskloop::executor::{ExecError, Executor, Result as ExecResult};
use taskloop::state::{Result as StoreResult, RunStore};
use taskloop::verifier::{Result as VerifyResult, Verifier, VerifyError};
use taskloop::{Driver, Limits};
use taskloop_core::events::EventType;
use taskloop_core::prompt::build_loop_prompt;
use taskloop_core::{
    ExecutionOutcome, IterationState, ProgressObserver, RunEvent, VerificationResult,
    UNPARSEABLE_COUNT,
};
use tokio_util::sync::CancellationToken;

pub const PROMISE: &str = "<promise>COMPLETE</promise>";
pub const PASS: &str = "<gate>PASS</gate>";
pub const FAIL: &str = "<gate>FAIL</gate>";

/// Executor that replays scripted replies in order.
///
/// Once the script runs out every call returns an empty output at zero cost.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<ExecResult<ExecutionOutcome>>>,
    prompts: Mutex<Vec<String>>,
    /// Cancel this token when the given call (1-based) starts.
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, output: &str, cost: f64) -> Self {
        self.push(Ok(ExecutionOutcome::new(output, cost).with_tokens(10, 5)))
    }

    pub fn fail(self, err: ExecError) -> Self {
        self.push(Err(err))
    }

    /// Cancel `token` when call `call` starts and answer it with a cancelled error.
    pub fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    fn push(self, reply: ExecResult<ExecutionOutcome>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
    ) -> ExecResult<ExecutionOutcome> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len()
        };

        if let Some((cancel_call, token)) = &self.cancel_on_call {
            if *cancel_call == call {
                token.cancel();
                return Err(ExecError::Cancelled {
                    partial: ExecutionOutcome::new("partial", 0.01),
                });
            }
        }

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutionOutcome::new("", 0.0)))
    }
}

pub fn verified(checked: i64, cost: f64) -> VerificationResult {
    VerificationResult {
        verified: true,
        unchecked: 0,
        checked,
        cost,
        tokens: 7,
    }
}

pub fn incomplete(unchecked: i64, checked: i64, cost: f64) -> VerificationResult {
    VerificationResult {
        verified: false,
        unchecked,
        checked,
        cost,
        tokens: 7,
    }
}

pub fn unparseable(cost: f64) -> VerificationResult {
    incomplete(UNPARSEABLE_COUNT, UNPARSEABLE_COUNT, cost)
}

/// Verifier that replays scripted results and records the file sets it saw.
///
/// Once the script runs out every call reports an unparseable response.
#[derive(Default)]
pub struct ScriptedVerifier {
    replies: Mutex<VecDeque<VerifyResult<VerificationResult>>>,
    seen: Mutex<Vec<Vec<PathBuf>>>,
    /// Cancelled when a cancelled reply is handed out.
    cancel: Option<CancellationToken>,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, result: VerificationResult) -> Self {
        self.replies.lock().unwrap().push_back(Ok(result));
        self
    }

    pub fn fail(self, err: ExecError) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(VerifyError::Exec(err)));
        self
    }

    /// Script a call that cancels `token` and reports itself cancelled after
    /// spending `cost`.
    pub fn cancel_with(mut self, token: CancellationToken, cost: f64) -> Self {
        self.cancel = Some(token);
        self.fail(ExecError::Cancelled {
            partial: ExecutionOutcome::new("", cost).with_tokens(3, 1),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<Vec<PathBuf>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(
        &self,
        _cancel: &CancellationToken,
        files: &[PathBuf],
    ) -> VerifyResult<VerificationResult> {
        self.seen.lock().unwrap().push(files.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(unparseable(0.0)));
        if let (Err(err), Some(token)) = (&reply, &self.cancel) {
            if err.is_cancelled() {
                token.cancel();
            }
        }
        reply
    }
}

/// In-memory store. Each `pop_queue` drains the next scripted batch.
pub struct MemoryStore {
    task: String,
    files: Mutex<Vec<PathBuf>>,
    batches: Mutex<VecDeque<Vec<PathBuf>>>,
    saved: Mutex<Vec<IterationState>>,
}

impl MemoryStore {
    pub fn new(task: &str, files: &[&str]) -> Self {
        Self {
            task: task.to_string(),
            files: Mutex::new(files.iter().map(PathBuf::from).collect()),
            batches: Mutex::new(VecDeque::new()),
            saved: Mutex::new(Vec::new()),
        }
    }

    /// Queue a batch to be returned by a later `pop_queue`.
    pub fn queue(self, paths: &[&str]) -> Self {
        self.batches
            .lock()
            .unwrap()
            .push_back(paths.iter().map(PathBuf::from).collect());
        self
    }

    pub fn saved(&self) -> Vec<IterationState> {
        self.saved.lock().unwrap().clone()
    }

    pub fn prompt(&self) -> String {
        self.rebuild_prompt().unwrap()
    }
}

impl RunStore for MemoryStore {
    fn check_queue(&self) -> StoreResult<Vec<PathBuf>> {
        Ok(self
            .batches
            .lock()
            .unwrap()
            .front()
            .cloned()
            .unwrap_or_default())
    }

    fn pop_queue(&self) -> StoreResult<Vec<PathBuf>> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn merge_files(&self, files: &[PathBuf]) -> StoreResult<()> {
        let mut current = self.files.lock().unwrap();
        for file in files {
            if !current.contains(file) {
                current.push(file.clone());
            }
        }
        Ok(())
    }

    fn rebuild_prompt(&self) -> StoreResult<String> {
        Ok(build_loop_prompt(
            &self.task,
            &self.files.lock().unwrap(),
            PROMISE,
        ))
    }

    fn files(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().clone()
    }

    fn save_state(&self, state: &IterationState) -> StoreResult<()> {
        self.saved.lock().unwrap().push(state.clone());
        Ok(())
    }
}

/// Observer that records every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<EventType>>,
    steps: Mutex<Vec<(String, usize, usize, u32, u32)>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<EventType> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events().iter().filter(|e| **e == kind).count()
    }

    /// `(step, position, total, retry, max_retries)` for each step start.
    pub fn step_starts(&self) -> Vec<(String, usize, usize, u32, u32)> {
        self.steps.lock().unwrap().clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_event(&self, event: &RunEvent<'_>) {
        self.events.lock().unwrap().push(event.event_type());
        if let RunEvent::StepStarted { progress } = event {
            self.steps.lock().unwrap().push((
                progress.step.clone(),
                progress.position,
                progress.total,
                progress.retry,
                progress.max_retries,
            ));
        }
    }
}

/// Collaborators for one test, kept alive alongside the driver.
pub struct Harness {
    pub executor: Arc<ScriptedExecutor>,
    pub verifier: Arc<ScriptedVerifier>,
    pub store: Arc<MemoryStore>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new(executor: ScriptedExecutor, verifier: ScriptedVerifier, store: MemoryStore) -> Self {
        Self {
            executor: Arc::new(executor),
            verifier: Arc::new(verifier),
            store: Arc::new(store),
            observer: Arc::new(RecordingObserver::default()),
        }
    }

    pub fn driver(&self, max_iterations: u32, max_budget: f64) -> Driver {
        Driver::new(
            Arc::clone(&self.executor) as Arc<dyn Executor>,
            Arc::clone(&self.verifier) as Arc<dyn Verifier>,
            Arc::clone(&self.store) as Arc<dyn RunStore>,
            Limits {
                max_iterations,
                max_budget,
            },
        )
        .with_task("Finish the plan.")
        .with_observer(Arc::clone(&self.observer) as Arc<dyn ProgressObserver>)
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
