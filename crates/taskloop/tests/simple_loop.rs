//! Simple iteration loop: termination budgets, completion protocol, and
//! queue-driven continuation.

mod support;

use std::path::PathBuf;

use support::{
    approx, incomplete, unparseable, verified, Harness, MemoryStore, ScriptedExecutor,
    ScriptedVerifier, PROMISE,
};
use taskloop::{ExecError, LoopError};
use taskloop_core::events::EventType;
use taskloop_core::{ExecutionOutcome, IterationState};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn verified_completion_with_empty_queue() {
    let h = Harness::new(
        ScriptedExecutor::new().reply(&format!("all done {PROMISE}"), 0.05),
        ScriptedVerifier::new().reply(verified(5, 0.001)),
        MemoryStore::new("Finish the plan.", &["plan.md"]),
    );

    let state = h
        .driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), &h.store.prompt())
        .await
        .unwrap();

    assert_eq!(state.iteration, 1);
    assert!(state.completed);
    assert!(approx(state.total_cost, 0.051));
    assert!(state.terminal_error.is_none());
    assert_eq!(h.verifier.seen(), vec![vec![PathBuf::from("plan.md")]]);
}

#[tokio::test]
async fn queued_files_continue_the_loop() {
    let h = Harness::new(
        ScriptedExecutor::new()
            .reply(PROMISE, 0.05)
            .reply(PROMISE, 0.05),
        ScriptedVerifier::new()
            .reply(verified(5, 0.001))
            .reply(verified(8, 0.001)),
        MemoryStore::new("Finish the plan.", &["plan.md"]).queue(&["extra.md"]),
    );

    let state = h
        .driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), &h.store.prompt())
        .await
        .unwrap();

    assert_eq!(state.iteration, 2);
    assert!(state.completed);
    assert!(approx(state.total_cost, 0.102));

    let prompts = h.executor.prompts();
    assert!(!prompts[0].contains("@extra.md"));
    assert!(prompts[1].starts_with("@plan.md @extra.md"));
    assert_eq!(
        h.verifier.seen()[1],
        vec![PathBuf::from("plan.md"), PathBuf::from("extra.md")]
    );
    assert_eq!(h.observer.count(EventType::QueueMerged), 1);
}

#[tokio::test]
async fn budget_equality_stops_the_run() {
    let h = Harness::new(
        ScriptedExecutor::new()
            .reply("working", 0.25)
            .reply("working", 0.25)
            .reply("working", 0.25)
            .reply("working", 0.25)
            .reply("working", 0.25),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );

    let err = h
        .driver(10, 1.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap_err();

    assert!(matches!(err.kind, LoopError::BudgetExceeded { .. }));
    assert_eq!(err.state.iteration, 4);
    assert!(approx(err.state.total_cost, 1.0));
    assert_eq!(h.executor.calls(), 4);
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn max_iterations_makes_exactly_n_calls() {
    let h = Harness::new(
        ScriptedExecutor::new(),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );

    let err = h
        .driver(3, 100.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap_err();

    assert!(matches!(err.kind, LoopError::MaxIterationsReached(3)));
    assert_eq!(err.state.iteration, 3);
    assert_eq!(h.executor.calls(), 3);
    assert_eq!(h.verifier.calls(), 0);
    assert_eq!(err.exit_code(), 2);
    assert_eq!(
        err.state.terminal_error.as_deref(),
        Some("max iterations reached (3)")
    );
}

#[tokio::test]
async fn unverified_claims_keep_iterating() {
    let h = Harness::new(
        ScriptedExecutor::new()
            .reply(PROMISE, 0.1)
            .reply(PROMISE, 0.1)
            .reply(PROMISE, 0.1),
        ScriptedVerifier::new()
            .reply(incomplete(2, 3, 0.01))
            .reply(unparseable(0.01))
            .reply(verified(5, 0.01)),
        MemoryStore::new("t", &["plan.md"]),
    );

    let state = h
        .driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap();

    assert_eq!(state.iteration, 3);
    assert_eq!(h.verifier.calls(), 3);
    // Verifier spend is booked even when verification fails.
    assert!(approx(state.total_cost, 0.33));
    assert_eq!(state.total_tokens_out, 3 * 5 + 3 * 7);
}

#[tokio::test]
async fn verifier_error_is_not_fatal() {
    let h = Harness::new(
        ScriptedExecutor::new().reply(PROMISE, 0.1).reply(PROMISE, 0.1),
        ScriptedVerifier::new()
            .fail(ExecError::ExitCode {
                code: 1,
                partial: ExecutionOutcome::new("", 0.02),
            })
            .reply(verified(1, 0.0)),
        MemoryStore::new("t", &[]),
    );

    let state = h
        .driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap();

    assert_eq!(state.iteration, 2);
    assert!(approx(state.total_cost, 0.22));
    assert_eq!(h.observer.count(EventType::VerificationFailed), 1);
}

#[tokio::test]
async fn cancelled_verification_ends_the_run() {
    let cancel = CancellationToken::new();
    let h = Harness::new(
        ScriptedExecutor::new().reply(PROMISE, 0.1),
        ScriptedVerifier::new().cancel_with(cancel.clone(), 0.02),
        MemoryStore::new("t", &[]),
    );

    let err = h
        .driver(1, 100.0)
        .run_simple_loop(&cancel, "prompt")
        .await
        .unwrap_err();

    assert!(err.kind.is_cancelled());
    assert_eq!(err.exit_code(), 130);
    assert_eq!(err.state.iteration, 1);
    assert!(approx(err.state.total_cost, 0.12));
    assert_eq!(h.observer.count(EventType::VerificationFailed), 1);
}

#[tokio::test]
async fn executor_error_keeps_partial_spend() {
    let h = Harness::new(
        ScriptedExecutor::new()
            .reply("working", 0.1)
            .fail(ExecError::Timeout {
                secs: 60,
                partial: ExecutionOutcome::new("half", 0.3).with_tokens(4, 2),
            }),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );

    let err = h
        .driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind,
        LoopError::Exec(ExecError::Timeout { secs: 60, .. })
    ));
    assert_eq!(err.state.iteration, 2);
    assert!(approx(err.state.total_cost, 0.4));
    assert_eq!(err.state.last_output, "half");
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn cancelled_before_first_call_makes_no_calls() {
    let h = Harness::new(
        ScriptedExecutor::new().reply(PROMISE, 0.1),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .driver(10, 100.0)
        .run_simple_loop(&cancel, "prompt")
        .await
        .unwrap_err();

    assert!(err.kind.is_cancelled());
    assert_eq!(err.state.iteration, 0);
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(err.exit_code(), 130);
}

#[tokio::test]
async fn cancellation_during_a_call_stops_the_run() {
    let cancel = CancellationToken::new();
    let h = Harness::new(
        ScriptedExecutor::new()
            .reply("working", 0.1)
            .cancel_on_call(2, cancel.clone()),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );

    let err = h
        .driver(10, 100.0)
        .run_simple_loop(&cancel, "prompt")
        .await
        .unwrap_err();

    assert!(matches!(err.kind, LoopError::Cancelled));
    assert_eq!(h.executor.calls(), 2);
    assert!(approx(err.state.total_cost, 0.11));
}

#[tokio::test]
async fn resumed_run_keeps_counters() {
    let h = Harness::new(
        ScriptedExecutor::new().reply(PROMISE, 0.05),
        ScriptedVerifier::new().reply(verified(3, 0.0)),
        MemoryStore::new("t", &[]),
    );
    let mut saved = IterationState::new();
    saved.iteration = 2;
    saved.record(0.5, 100, 50);
    saved.terminal_error = Some("cancelled".to_string());

    let state = h
        .driver(10, 100.0)
        .resume_from(saved.clone())
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap();

    assert_eq!(state.run_id, saved.run_id);
    assert_eq!(state.iteration, 3);
    assert!(approx(state.total_cost, 0.55));
    assert_eq!(state.total_tokens_in, 110);
    assert!(state.terminal_error.is_none());
}

#[tokio::test]
async fn resumed_run_applies_limits_to_totals() {
    let h = Harness::new(
        ScriptedExecutor::new().reply("working", 0.5),
        ScriptedVerifier::new(),
        MemoryStore::new("t", &[]),
    );
    let mut saved = IterationState::new();
    saved.iteration = 1;
    saved.record(0.5, 0, 0);

    let err = h
        .driver(10, 1.0)
        .resume_from(saved)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap_err();

    assert!(matches!(err.kind, LoopError::BudgetExceeded { .. }));
    assert_eq!(err.state.iteration, 2);
    assert_eq!(h.executor.calls(), 1);
}

#[tokio::test]
async fn state_is_saved_every_iteration() {
    let h = Harness::new(
        ScriptedExecutor::new().reply("working", 0.1).reply(PROMISE, 0.1),
        ScriptedVerifier::new().reply(verified(1, 0.0)),
        MemoryStore::new("t", &[]),
    );

    h.driver(10, 100.0)
        .run_simple_loop(&CancellationToken::new(), "prompt")
        .await
        .unwrap();

    let saved = h.store.saved();
    let iterations: Vec<u32> = saved.iter().map(|s| s.iteration).collect();
    // One save per finished iteration plus the final save.
    assert_eq!(iterations, vec![1, 2, 2]);
    assert!(saved.last().unwrap().completed);
    assert_eq!(
        h.observer.events().last(),
        Some(&EventType::RunFinished)
    );
}
