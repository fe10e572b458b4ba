//! Lifecycle tests for the orchestrator: submission, cancellation, retry
//! policy, deadlines, and state-machine legality.


use std::time::Duration;

use simforge::error::SimforgeError;
use simforge::job::JobState;
use simforge::params::Parameters;
use test_harness::{beam_parameters, fast_config, Outcome, ScriptedExecutor, TestHarness};

#[tokio::test]
async fn submitted_job_completes() {
    let executor = ScriptedExecutor::new(Duration::from_millis(20));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let view = harness.wait_for_state(id, JobState::Completed).await;

    assert_eq!(executor.call_count(), 1);
    assert!(view.completed_at.is_some());
    assert!(view.failure_reason.is_none());
    let summary = view.result_summary.expect("completed job has a summary");
    assert_eq!(summary["max_stress"], 1.5e8);
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn submit_returns_before_execution_finishes() {
    let executor = ScriptedExecutor::new(Duration::from_millis(300));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    // Submission must not block on the solve; the job is still in flight.
    let view = harness.orchestrator.status(id).await.unwrap();
    assert!(view.state == JobState::Pending || view.state == JobState::Running);

    harness.wait_for_state(id, JobState::Completed).await;
}

#[tokio::test]
async fn invalid_parameters_rejected_without_state_change() {
    let executor = ScriptedExecutor::new(Duration::ZERO);
    let harness = TestHarness::start(fast_config(), executor.clone());

    let bad = Parameters::new().set("pressure", f64::NAN);
    let err = harness.orchestrator.submit(bad).await;
    assert!(matches!(err, Err(SimforgeError::InvalidParameters(_))));

    assert!(harness.orchestrator.list().await.unwrap().is_empty());
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn permanent_failure_fails_without_retry() {
    let executor = ScriptedExecutor::with_script(
        Duration::from_millis(10),
        vec![Outcome::FailPermanent("parameters are unsolvable")],
    );
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let view = harness.wait_for_state(id, JobState::Failed).await;

    assert_eq!(executor.call_count(), 1);
    let reason = view.failure_reason.expect("failed job carries a reason");
    assert!(reason.contains("unsolvable"));
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn transient_failures_retried_until_success() {
    let executor = ScriptedExecutor::with_script(
        Duration::from_millis(5),
        vec![
            Outcome::FailTransient("engine crashed"),
            Outcome::FailTransient("engine crashed"),
            Outcome::Succeed,
        ],
    );
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Completed).await;

    assert_eq!(executor.call_count(), 3);

    // Exponential backoff: the gap between attempts never shrinks.
    let times = executor.call_times.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(
        second_gap >= first_gap,
        "backoff shrank: {first_gap:?} then {second_gap:?}"
    );
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let executor = ScriptedExecutor::with_script(
        Duration::from_millis(5),
        vec![
            Outcome::FailTransient("no license seat"),
            Outcome::FailTransient("no license seat"),
            Outcome::FailTransient("no license seat"),
            Outcome::FailTransient("no license seat"),
        ],
    );
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let view = harness.wait_for_state(id, JobState::Failed).await;

    // max_retries = 3: one initial attempt plus three retries.
    assert_eq!(executor.call_count(), 4);
    assert!(view.failure_reason.unwrap().contains("no license seat"));
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn hard_deadline_reclaims_the_worker() {
    let executor = ScriptedExecutor::new(Duration::from_secs(30));
    let config = fast_config()
        .with_retries(0, Duration::from_millis(10), Duration::from_millis(10))
        .with_deadlines(Duration::from_millis(20), Duration::from_millis(60));
    let harness = TestHarness::start(config, executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let view = harness.wait_for_state(id, JobState::Failed).await;

    assert!(view.failure_reason.unwrap().contains("deadline"));
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn cancel_before_pickup_never_invokes_executor() {
    let executor = ScriptedExecutor::new(Duration::from_millis(10));
    // Loop not started: the job stays queued.
    let harness = TestHarness::build(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let state = harness.orchestrator.cancel(id).await.unwrap();
    assert_eq!(state, JobState::Failed);

    harness.start_loop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(executor.call_count(), 0);
    let view = harness.orchestrator.status(id).await.unwrap();
    assert_eq!(view.state, JobState::Failed);
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn cancel_running_job_wins_over_late_completion() {
    let executor = ScriptedExecutor::new(Duration::from_millis(400));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Running).await;

    let state = harness.orchestrator.cancel(id).await.unwrap();
    assert_eq!(state, JobState::Failed);

    // Let the underlying solve run out; its result must not be honored.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let view = harness.orchestrator.status(id).await.unwrap();
    assert_eq!(view.state, JobState::Failed);
    assert!(view.result_summary.is_none());
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let executor = ScriptedExecutor::new(Duration::from_millis(300));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Running).await;

    assert_eq!(harness.orchestrator.cancel(id).await.unwrap(), JobState::Failed);
    // Second cancel is a no-op reporting the terminal state.
    assert_eq!(harness.orchestrator.cancel(id).await.unwrap(), JobState::Failed);

    let view = harness.orchestrator.status(id).await.unwrap();
    assert_eq!(view.failure_reason.as_deref(), Some("cancelled by user"));
}

#[tokio::test]
async fn cancel_after_completion_is_a_noop() {
    let executor = ScriptedExecutor::new(Duration::from_millis(10));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Completed).await;

    let state = harness.orchestrator.cancel(id).await.unwrap();
    assert_eq!(state, JobState::Completed);
    // The result survived the no-op cancel.
    let view = harness.orchestrator.status(id).await.unwrap();
    assert!(view.result_summary.is_some());
}

#[tokio::test]
async fn queue_full_rejects_submission() {
    let executor = ScriptedExecutor::new(Duration::ZERO);
    let config = fast_config().with_queue_depth(1);
    // Loop not started, so the first submission occupies the only slot.
    let harness = TestHarness::build(config, executor.clone());

    harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let err = harness
        .orchestrator
        .submit(Parameters::new().set("length", 9.0))
        .await;
    assert!(matches!(err, Err(SimforgeError::QueueFull)));

    // The rejected job was rolled back, not left pending forever.
    assert_eq!(harness.orchestrator.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_running_job_is_illegal() {
    let executor = ScriptedExecutor::new(Duration::from_millis(300));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Running).await;

    let err = harness.orchestrator.delete(id).await;
    assert!(matches!(err, Err(SimforgeError::IllegalState { .. })));

    // Cancel first, then delete succeeds.
    harness.orchestrator.cancel(id).await.unwrap();
    harness.orchestrator.delete(id).await.unwrap();
    assert!(matches!(
        harness.orchestrator.status(id).await,
        Err(SimforgeError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn resume_requires_terminal_state() {
    let executor = ScriptedExecutor::new(Duration::from_millis(300));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Running).await;

    let err = harness.orchestrator.resume(id).await;
    assert!(matches!(err, Err(SimforgeError::IllegalState { .. })));
}

#[tokio::test]
async fn resume_failed_job_reruns_it() {
    let executor = ScriptedExecutor::with_script(
        Duration::from_millis(5),
        vec![Outcome::FailPermanent("bad mesh")],
    );
    let harness = TestHarness::start(fast_config(), executor.clone());

    let id = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(id, JobState::Failed).await;

    harness.orchestrator.resume(id).await.unwrap();
    let view = harness.wait_for_state(id, JobState::Completed).await;

    assert_eq!(executor.call_count(), 2);
    assert!(view.failure_reason.is_none());
    assert!(view.result_summary.is_some());
    harness.assert_job_invariants(id).await;
}

#[tokio::test]
async fn unknown_job_operations_fail_cleanly() {
    let executor = ScriptedExecutor::new(Duration::ZERO);
    let harness = TestHarness::start(fast_config(), executor.clone());

    let ghost = simforge::job::JobId::new();
    assert!(matches!(
        harness.orchestrator.status(ghost).await,
        Err(SimforgeError::JobNotFound(_))
    ));
    assert!(matches!(
        harness.orchestrator.cancel(ghost).await,
        Err(SimforgeError::JobNotFound(_))
    ));
    assert!(matches!(
        harness.orchestrator.delete(ghost).await,
        Err(SimforgeError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn list_reports_jobs_in_creation_order() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let a = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    let b = harness
        .orchestrator
        .submit(Parameters::new().set("length", 7.0))
        .await
        .unwrap();

    harness.wait_for_state(a, JobState::Completed).await;
    harness.wait_for_state(b, JobState::Completed).await;

    let listed = harness.orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, a);
    assert_eq!(listed[1].id, b);
}

#[tokio::test]
async fn purge_removes_old_terminal_jobs_only() {
    let executor = ScriptedExecutor::new(Duration::from_millis(300));
    let harness = TestHarness::start(fast_config(), executor.clone());

    let done = harness.orchestrator.submit(beam_parameters()).await.unwrap();
    harness.wait_for_state(done, JobState::Completed).await;

    let also_done = harness
        .orchestrator
        .submit(Parameters::new().set("length", 8.0))
        .await
        .unwrap();
    harness.wait_for_state(also_done, JobState::Completed).await;

    // A job still in flight must survive the sweep.
    let running = harness
        .orchestrator
        .submit(Parameters::new().set("length", 9.0))
        .await
        .unwrap();

    // Zero max-age makes every terminal job "old".
    let purged = harness
        .orchestrator
        .purge_older_than(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(purged, 2);

    let remaining = harness.orchestrator.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, running);
}
