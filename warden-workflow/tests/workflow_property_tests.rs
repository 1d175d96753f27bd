//! Property-Based Tests for Workflow Execution
//!
//! **Sequencing**: steps without delays run inline in order and a completed
//! execution leaves no record behind.
//!
//! **Delay suspension**: a step with `after` is scheduled, never run inline,
//! and the store holds exactly one record per suspended execution.
//!
//! **Restart**: a restart jumps to the requested position; an out-of-range
//! position fails without touching the context.
//!
//! **Failure**: a failed step rolls back its writes, keeps its position and
//! is retried on the next resume.
//!
//! **Claim fencing**: a run resumed from a claimed record never writes the
//! record back once it was removed or taken over by another node.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use warden_workflow::{
    run_due_steps, scheduled_step_task, DefaultExecutionContext, ExecutionContext,
    ExecutionState, InMemoryWorkflowStateStore, LmdbWorkflowStateStore, RestartStepProvider,
    RunOutcome, RunnerConfig, ScheduledStep, SchedulerConfig, SchedulerMetrics, StepSession,
    WorkflowDefinition, WorkflowStateStore, WorkflowStep,
};
use warden_test_utils::assertions::{
    assert_err, assert_invalid_restart, assert_scheduled, assert_step_failed,
};
use warden_test_utils::fixtures::{self, WorkflowHarness};
use warden_test_utils::{
    FailingStepProvider, RecordingStepProvider, StepProvider, WardenError, WardenResult,
    WorkflowError,
};

const RECORD: &str = WorkflowHarness::RECORDER_ID;
const RESOURCE: &str = WorkflowHarness::RESOURCE_ID;

// ============================================================================
// HELPERS
// ============================================================================

fn harness_with(
    workflows: Vec<WorkflowDefinition>,
    providers: Vec<Arc<dyn StepProvider>>,
    config: RunnerConfig,
) -> WorkflowHarness {
    WorkflowHarness::build(
        workflows,
        providers,
        Arc::new(InMemoryWorkflowStateStore::new()),
        config,
    )
}

async fn records(harness: &WorkflowHarness) -> Vec<ScheduledStep> {
    harness.state_store.list().await.unwrap()
}

/// While its step runs, either cancels the execution or hands its claim to
/// `node-b` as if this node had stalled past the claim timeout.
struct InterruptingStepProvider {
    store: Arc<dyn WorkflowStateStore>,
    takeover: bool,
}

impl InterruptingStepProvider {
    const ID: &'static str = "interrupt";
}

#[async_trait]
impl StepProvider for InterruptingStepProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        _step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        _session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        let execution_id = ctx.execution_id();
        if self.takeover {
            self.store.reclaim_stale(Utc::now() + ChronoDuration::seconds(1)).await?;
            self.store.claim(execution_id, "node-b").await?;
        } else {
            self.store.remove(execution_id).await?;
        }
        Ok(())
    }
}

fn interrupted_harness(second_after: Option<&str>, takeover: bool) -> WorkflowHarness {
    let store: Arc<dyn WorkflowStateStore> = Arc::new(InMemoryWorkflowStateStore::new());
    let second = WorkflowStep::new("B", RECORD);
    let workflow = WorkflowDefinition::new("interrupted", "Interrupted", "user")
        .with_step(WorkflowStep::new("A", InterruptingStepProvider::ID).with_after("1m"))
        .with_step(match second_after {
            Some(after) => second.with_after(after),
            None => second,
        });
    let interrupter = InterruptingStepProvider {
        store: store.clone(),
        takeover,
    };
    WorkflowHarness::build(
        vec![workflow],
        vec![Arc::new(interrupter)],
        store,
        RunnerConfig::default(),
    )
}

// ============================================================================
// SEQUENCING
// ============================================================================

#[tokio::test]
async fn test_three_steps_run_in_order_and_leave_no_record() {
    let harness = WorkflowHarness::new(vec![fixtures::three_step_workflow(RECORD)]);

    let (state, outcome) = harness.runner.start("three-steps", RESOURCE).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(harness.recorder.trace(), vec!["A", "B", "C"]);
    assert!(harness
        .state_store
        .get(&state.execution_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(harness.listener.executed_steps(), vec!["A", "B", "C"]);
    assert_eq!(harness.listener.completed(), 1);
    assert_eq!(harness.sessions.commits(), 3);
}

#[tokio::test]
async fn test_each_step_runs_its_own_provider() {
    let other = RecordingStepProvider::new("other");
    let harness = harness_with(
        vec![fixtures::four_step_workflow(RECORD, "other")],
        vec![Arc::new(other.clone())],
        RunnerConfig::default(),
    );

    let (_, outcome) = harness.runner.start("four-steps", RESOURCE).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(harness.recorder.trace(), vec!["A", "C", "D"]);
    assert_eq!(other.trace(), vec!["B"]);
    assert_eq!(harness.listener.executed_steps(), vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn test_unknown_workflow_is_rejected() {
    let harness = WorkflowHarness::new(Vec::new());
    assert_err(&harness.runner.start("missing", RESOURCE).await);
    assert!(records(&harness).await.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_inline_workflows_run_every_step_once(steps in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;

        let workflow = fixtures::inline_workflow("inline", RECORD, steps);
        let expected: Vec<String> = workflow.steps.iter().map(|s| s.id.clone()).collect();
        let harness = WorkflowHarness::new(vec![workflow]);

        let outcome = runtime.block_on(harness.runner.start("inline", RESOURCE));
        let (_, outcome) = outcome.map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(outcome, RunOutcome::Completed);
        prop_assert_eq!(harness.recorder.trace(), expected);
        prop_assert!(runtime.block_on(records(&harness)).is_empty());
    }
}

// ============================================================================
// DELAY SUSPENSION
// ============================================================================

#[tokio::test]
async fn test_delayed_step_is_scheduled_not_run() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);

    let before = Utc::now();
    let (state, outcome) = harness.runner.start("delayed", RESOURCE).await.unwrap();
    assert_scheduled(&outcome, "first");
    assert!(harness.recorder.trace().is_empty());

    let stored = records(&harness).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].execution_id, state.execution_id);
    assert_eq!(stored[0].step_id, "first");
    assert!(stored[0].scheduled_at >= before + ChronoDuration::minutes(10));

    // The trigger for step 0 fires: it runs and step 1 is scheduled.
    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_scheduled(&outcome, "second");
    assert_eq!(harness.recorder.trace(), vec!["first"]);

    let stored = records(&harness).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].execution_id, state.execution_id);
    assert_eq!(stored[0].step_id, "second");
    assert!(stored[0].is_pending());

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(harness.recorder.trace(), vec!["first", "second"]);
    assert!(records(&harness).await.is_empty());
    assert_eq!(harness.listener.scheduled_steps(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_resume_of_claimed_record_is_skipped() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    let (state, _) = harness.runner.start("delayed", RESOURCE).await.unwrap();

    let claimed = harness
        .state_store
        .claim(&state.execution_id, "other-node")
        .await
        .unwrap();
    assert!(claimed.is_some());

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(harness.recorder.trace().is_empty());
}

// ============================================================================
// RESTART
// ============================================================================

#[test]
fn test_restart_jumps_back_regardless_of_position() {
    let workflow = fixtures::four_step_workflow(RECORD, RECORD);
    let state = ExecutionState::new("four-steps", RESOURCE).with_step("B");
    let mut ctx = DefaultExecutionContext::rehydrate(&state, workflow).unwrap();

    ctx.restart(0).unwrap();
    assert_eq!(ctx.next_step().map(|s| s.id.as_str()), Some("A"));
}

#[test]
fn test_restart_out_of_range_leaves_context_untouched() {
    let workflow = fixtures::four_step_workflow(RECORD, RECORD);
    let state = ExecutionState::new("four-steps", RESOURCE).with_step("B");
    let mut ctx = DefaultExecutionContext::rehydrate(&state, workflow).unwrap();

    assert_invalid_restart(&ctx.restart(-1));
    assert_invalid_restart(&ctx.restart(99));
    assert_eq!(ctx.restart_position(), None);
    assert_eq!(ctx.next_step().map(|s| s.id.as_str()), Some("C"));
}

#[tokio::test]
async fn test_restart_loop_stops_at_inline_limit() {
    let workflow = WorkflowDefinition::new("loop", "Loop", "user")
        .with_step(WorkflowStep::new("A", RECORD))
        .with_step(
            WorkflowStep::new("B", RestartStepProvider::ID).with_config(json!({ "position": 0 })),
        )
        .with_step(WorkflowStep::new("C", RECORD))
        .with_step(WorkflowStep::new("D", RECORD));
    let harness = harness_with(
        vec![workflow],
        Vec::new(),
        RunnerConfig::default().with_max_inline_steps(5),
    );

    let result = harness.runner.start("loop", RESOURCE).await;

    match result {
        Err(WardenError::Workflow(WorkflowError::InlineStepLimit { limit, .. })) => {
            assert_eq!(limit, 5)
        }
        other => panic!("Expected InlineStepLimit, got: {:?}", other),
    }
    // A, B, A, B, A: step C is never reached.
    assert_eq!(harness.recorder.trace(), vec!["A", "A", "A"]);

    let failures = harness.listener.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.as_deref(), Some("B"));
}

// ============================================================================
// FAILURE AND RETRY
// ============================================================================

#[tokio::test]
async fn test_failed_step_rolls_back_and_retries_in_place() {
    let flaky = Arc::new(FailingStepProvider::failing_times("flaky", 1).with_restart(0));
    let workflow = WorkflowDefinition::new("retry", "Retry", "user")
        .with_step(WorkflowStep::new("A", RECORD))
        .with_step(WorkflowStep::new("B", "flaky").with_after("1m"))
        .with_step(WorkflowStep::new("C", RECORD));
    let harness = harness_with(vec![workflow], vec![flaky.clone()], RunnerConfig::default());

    let (state, outcome) = harness.runner.start("retry", RESOURCE).await.unwrap();
    assert_scheduled(&outcome, "B");

    let result = harness.runner.resume(&state.execution_id).await;
    assert_step_failed(&result, "B");
    assert_eq!(flaky.attempts(), 1);

    // The staged write and the restart request were discarded.
    assert_eq!(
        harness
            .resources()
            .attribute(RESOURCE, FailingStepProvider::TOUCHED_ATTRIBUTE),
        None
    );
    let stored = records(&harness).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].step_id, "B");
    assert!(stored[0].is_pending());

    let failures = harness.listener.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.as_deref(), Some("B"));

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(flaky.attempts(), 2);
    assert_eq!(harness.recorder.trace(), vec!["A", "C"]);
    assert!(records(&harness).await.is_empty());
}

#[tokio::test]
async fn test_committed_steps_survive_later_failure() {
    let workflow = WorkflowDefinition::new("partial", "Partial", "user")
        .with_step(
            WorkflowStep::new("set", "set-attribute")
                .with_config(json!({ "name": "stage", "value": "one" })),
        )
        .with_step(WorkflowStep::new("boom", "always-fails"));
    let harness = harness_with(
        vec![workflow],
        vec![Arc::new(FailingStepProvider::new("always-fails"))],
        RunnerConfig::default(),
    );

    let result = harness.runner.start("partial", RESOURCE).await;
    assert_step_failed(&result, "boom");

    assert_eq!(
        harness.resources().attribute(RESOURCE, "stage").as_deref(),
        Some("one")
    );
    assert_eq!(
        harness
            .resources()
            .attribute(RESOURCE, FailingStepProvider::TOUCHED_ATTRIBUTE),
        None
    );
    assert!(harness.sessions.rollbacks() >= 1);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancelled_execution_is_skipped_on_resume() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    let (state, _) = harness.runner.start("delayed", RESOURCE).await.unwrap();

    assert!(harness.runner.cancel(&state.execution_id).await.unwrap());
    assert!(!harness.runner.cancel(&state.execution_id).await.unwrap());

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(harness.recorder.trace().is_empty());
}

#[tokio::test]
async fn test_removed_resource_cancels_scheduled_step() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    let (state, _) = harness.runner.start("delayed", RESOURCE).await.unwrap();

    harness.resources().remove(RESOURCE).unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(records(&harness).await.is_empty());
    assert!(harness.recorder.trace().is_empty());
}

#[tokio::test]
async fn test_cancel_during_step_is_not_rescheduled() {
    let harness = interrupted_harness(Some("1m"), false);
    let (state, _) = harness.runner.start("interrupted", RESOURCE).await.unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(harness.state_store.get(&state.execution_id).await.unwrap().is_none());
    assert!(harness.listener.scheduled_steps().iter().all(|step| step != "B"));
}

#[tokio::test]
async fn test_cancel_during_step_stops_inline_successors() {
    let harness = interrupted_harness(None, false);
    let (state, _) = harness.runner.start("interrupted", RESOURCE).await.unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(harness.recorder.trace().is_empty());
    assert!(records(&harness).await.is_empty());
    assert_eq!(harness.listener.completed(), 0);
}

#[tokio::test]
async fn test_taken_over_claim_is_left_to_its_new_owner() {
    let harness = interrupted_harness(Some("1m"), true);
    let (state, _) = harness.runner.start("interrupted", RESOURCE).await.unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    let record = harness.state_store.get(&state.execution_id).await.unwrap().unwrap();
    assert_eq!(record.step_id, "A");
    assert!(record.is_claimed_by("node-b"));
}

#[tokio::test]
async fn test_disabled_workflow_leaves_scheduled_step_pending() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    let (state, _) = harness.runner.start("delayed", RESOURCE).await.unwrap();

    let mut disabled = fixtures::delayed_workflow(RECORD);
    disabled.enabled = false;
    harness.sessions.workflows().register(disabled).unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(harness.recorder.trace().is_empty());
    let record = harness.state_store.get(&state.execution_id).await.unwrap().unwrap();
    assert_eq!(record.step_id, "first");
    assert!(record.is_pending());
}

#[tokio::test]
async fn test_removed_workflow_reports_no_failure() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    let (state, _) = harness.runner.start("delayed", RESOURCE).await.unwrap();
    harness.sessions.workflows().remove("delayed").unwrap();

    let outcome = harness.runner.resume(&state.execution_id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(records(&harness).await.is_empty());
    assert!(harness.listener.failures().is_empty());
}

#[tokio::test]
async fn test_cancel_for_resource_removes_every_execution() {
    let harness = WorkflowHarness::new(vec![fixtures::delayed_workflow(RECORD)]);
    harness.runner.start("delayed", RESOURCE).await.unwrap();
    harness.runner.start("delayed", RESOURCE).await.unwrap();
    assert_eq!(records(&harness).await.len(), 2);

    assert_eq!(harness.runner.cancel_for_resource(RESOURCE).await.unwrap(), 2);
    assert!(records(&harness).await.is_empty());
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[tokio::test]
async fn test_run_due_steps_resumes_only_due_records() {
    let harness = WorkflowHarness::new(vec![fixtures::three_step_workflow(RECORD)]);
    let due = ExecutionState::new("three-steps", RESOURCE);
    let later = ExecutionState::new("three-steps", RESOURCE);
    harness
        .state_store
        .schedule(ScheduledStep::pending(&due, "B", Utc::now() - ChronoDuration::seconds(1)))
        .await
        .unwrap();
    harness
        .state_store
        .schedule(ScheduledStep::pending(&later, "B", Utc::now() + ChronoDuration::hours(1)))
        .await
        .unwrap();

    let metrics = SchedulerMetrics::new();
    run_due_steps(&harness.runner, &SchedulerConfig::development(), &metrics).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.claimed, 1);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.cycles, 1);
    assert_eq!(harness.recorder.trace(), vec!["B", "C"]);

    let remaining = records(&harness).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].execution_id, later.execution_id);
}

#[tokio::test]
async fn test_scheduler_task_stops_on_shutdown() {
    let harness = WorkflowHarness::new(vec![fixtures::three_step_workflow(RECORD)]);
    let due = ExecutionState::new("three-steps", RESOURCE);
    harness
        .state_store
        .schedule(ScheduledStep::pending(&due, "A", Utc::now()))
        .await
        .unwrap();

    let config = SchedulerConfig::development()
        .with_poll_interval(std::time::Duration::from_millis(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduled_step_task(
        harness.runner.clone(),
        config,
        shutdown_rx,
    ));

    for _ in 0..100 {
        if records(&harness).await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    let metrics = handle.await.unwrap();
    assert_eq!(metrics.snapshot().completed, 1);
    assert_eq!(harness.recorder.trace(), vec!["A", "B", "C"]);
}

// ============================================================================
// LMDB PERSISTENCE
// ============================================================================

#[tokio::test]
async fn test_suspended_execution_survives_store_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let execution_id = {
        let store = Arc::new(LmdbWorkflowStateStore::open(dir.path(), 16).unwrap());
        let harness = WorkflowHarness::build(
            vec![fixtures::delayed_workflow(RECORD)],
            Vec::new(),
            store,
            RunnerConfig::default(),
        );
        let (state, outcome) = harness.runner.start("delayed", RESOURCE).await.unwrap();
        assert_scheduled(&outcome, "first");
        state.execution_id
    };

    let store = Arc::new(LmdbWorkflowStateStore::open(dir.path(), 16).unwrap());
    let harness = WorkflowHarness::build(
        vec![fixtures::delayed_workflow(RECORD)],
        Vec::new(),
        store,
        RunnerConfig::default(),
    );

    let outcome = harness.runner.resume(&execution_id).await.unwrap();
    assert_scheduled(&outcome, "second");
    assert_eq!(harness.recorder.trace(), vec!["first"]);

    let stored = records(&harness).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].step_id, "second");
}
