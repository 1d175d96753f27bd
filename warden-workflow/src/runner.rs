//! The workflow runner.
//!
//! One invocation drives an execution through its steps until it completes,
//! suspends on a delayed step, or fails:
//!
//! ```text
//! start ──► run step N ──► next has delay? ──yes──► schedule(N+1), stop
//!               ▲                │ no
//!               └──── N+1 ◄──────┤
//!                                └── no next ──► remove record, completed
//! ```
//!
//! Each step runs in its own [`StepSession`] and commits before the next step
//! is chosen. A failing step is rolled back, reported through
//! [`WorkflowEventListener::on_step_failed`], and its error returned as is;
//! the persisted record, if any, keeps its position and is released for a
//! later retry.
//!
//! A run resumed from a claimed record writes back only while this node still
//! holds the claim. If the record was removed mid-run the execution is
//! treated as cancelled and nothing is rescheduled.

use chrono::Utc;
use std::sync::Arc;

use warden_core::constants::DEFAULT_MAX_INLINE_STEPS;
use warden_core::{env, Timestamp, WardenError, WardenResult, WorkflowError};

use crate::context::{DefaultExecutionContext, ExecutionContext, ExecutionState};
use crate::definition::{WorkflowDefinition, WorkflowStep};
use crate::events::{TracingEventListener, WorkflowEventListener};
use crate::provider::StepProviderRegistry;
use crate::resource::ResourceTypeRegistry;
use crate::session::{SessionFactory, StepSession};
use crate::state::{ScheduledStep, WorkflowStateStore};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name this node claims scheduled records under.
    pub node_id: String,
    /// Steps one invocation may run without suspending before it is aborted
    /// as a restart loop.
    pub max_inline_steps: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            max_inline_steps: DEFAULT_MAX_INLINE_STEPS,
        }
    }
}

impl RunnerConfig {
    /// Create RunnerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARDEN_NODE_ID`: Node name used for claims (default: local)
    /// - `WARDEN_RUNNER_MAX_INLINE_STEPS`: Inline step limit (default: 1000)
    pub fn from_env() -> Self {
        Self {
            node_id: env::string_or("WARDEN_NODE_ID", "local"),
            max_inline_steps: env::parse_or(
                "WARDEN_RUNNER_MAX_INLINE_STEPS",
                DEFAULT_MAX_INLINE_STEPS,
            ),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_max_inline_steps(mut self, max_inline_steps: usize) -> Self {
        self.max_inline_steps = max_inline_steps;
        self
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// How a runner invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step ran; the state record is gone.
    Completed,
    /// The run suspended; `step_id` resumes at `at`.
    Scheduled { step_id: String, at: Timestamp },
    /// The resource or workflow disappeared, or the record was removed while
    /// a step ran; no record is left.
    Cancelled,
    /// Nothing to do: the record was gone, already claimed, or the workflow
    /// is disabled. A disabled workflow's record stays pending.
    Skipped,
}

struct StepOutcome {
    executed: ExecutionState,
    next: Option<WorkflowStep>,
    delay: Option<std::time::Duration>,
    ran: bool,
}

fn scheduled_time(step: &WorkflowStep, delay: std::time::Duration) -> Result<Timestamp, WorkflowError> {
    let out_of_range = |reason: &str| WorkflowError::InvalidDuration {
        value: step.after.clone().unwrap_or_default(),
        reason: reason.to_string(),
    };
    let delay = chrono::Duration::from_std(delay).map_err(|_| out_of_range("delay out of range"))?;
    Utc::now()
        .checked_add_signed(delay)
        .ok_or_else(|| out_of_range("scheduled time out of range"))
}

// ============================================================================
// RUNNER
// ============================================================================

/// Drives workflow executions. Cheap to share behind an `Arc`.
pub struct WorkflowRunner {
    sessions: Arc<dyn SessionFactory>,
    state_store: Arc<dyn WorkflowStateStore>,
    providers: StepProviderRegistry,
    resources: ResourceTypeRegistry,
    listener: Arc<dyn WorkflowEventListener>,
    config: RunnerConfig,
}

impl WorkflowRunner {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        state_store: Arc<dyn WorkflowStateStore>,
        providers: StepProviderRegistry,
        resources: ResourceTypeRegistry,
        config: RunnerConfig,
    ) -> Self {
        Self {
            sessions,
            state_store,
            providers,
            resources,
            listener: Arc::new(TracingEventListener),
            config,
        }
    }

    /// Replace the default [`TracingEventListener`].
    pub fn with_listener(mut self, listener: Arc<dyn WorkflowEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn state_store(&self) -> &Arc<dyn WorkflowStateStore> {
        &self.state_store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start a new execution of `workflow_id` on `resource_id`.
    ///
    /// If the first step declares a delay it is scheduled rather than run.
    pub async fn start(
        &self,
        workflow_id: &str,
        resource_id: &str,
    ) -> WardenResult<(ExecutionState, RunOutcome)> {
        let state = ExecutionState::new(workflow_id, resource_id);
        let workflow = self.load_workflow(workflow_id).await?;

        if !workflow.enabled {
            tracing::debug!(workflow_id, "Workflow disabled, not starting");
            return Ok((state, RunOutcome::Skipped));
        }
        if !self.resource_exists(&workflow, resource_id)? {
            tracing::debug!(workflow_id, resource_id, "Resource not found, not starting");
            return Ok((state, RunOutcome::Cancelled));
        }

        let Some(first) = workflow.first_step() else {
            self.listener.on_workflow_completed(&state);
            return Ok((state, RunOutcome::Completed));
        };
        let state = state.with_step(first.id.clone());

        if let Some(delay) = first.delay()? {
            let outcome = self.schedule(&state, first, delay, false).await?;
            return Ok((state, outcome));
        }

        let outcome = self.run_workflow_task(state.clone()).await?;
        Ok((state, outcome))
    }

    /// Start `workflow_id` for every resource of its type, returning how many
    /// executions started. Individual failures are reported through the
    /// listener and do not stop the others.
    pub async fn start_for_all(&self, workflow_id: &str) -> WardenResult<usize> {
        let workflow = self.load_workflow(workflow_id).await?;
        let resource_ids = self.resources.require(&workflow.resource_type)?.resource_ids()?;

        let mut started = 0;
        for resource_id in resource_ids {
            match self.start(workflow_id, &resource_id).await {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::warn!(workflow_id, resource_id = %resource_id, error = %e, "Failed to start workflow");
                }
            }
        }
        Ok(started)
    }

    /// Claim and run the scheduled record of `execution_id`.
    ///
    /// A record that is gone (cancelled) or claimed by another node is
    /// skipped.
    pub async fn resume(&self, execution_id: &str) -> WardenResult<RunOutcome> {
        match self
            .state_store
            .claim(execution_id, &self.config.node_id)
            .await?
        {
            Some(record) => self.run_claimed(record).await,
            None => {
                tracing::debug!(execution_id, "Scheduled step no longer pending, skipping");
                Ok(RunOutcome::Skipped)
            }
        }
    }

    /// Run a record this node has already claimed.
    pub async fn run_claimed(&self, record: ScheduledStep) -> WardenResult<RunOutcome> {
        let state = record.execution_state();
        let node = self.config.node_id.as_str();

        let workflow = match self.load_workflow(&state.workflow_id).await {
            Ok(workflow) => workflow,
            Err(WardenError::Workflow(WorkflowError::UnknownWorkflow { .. })) => {
                tracing::warn!(
                    execution_id = %state.execution_id,
                    workflow_id = %state.workflow_id,
                    "Workflow removed, cancelling scheduled step"
                );
                self.state_store.complete(&state.execution_id, node).await?;
                return Ok(RunOutcome::Cancelled);
            }
            Err(e) => {
                self.listener.on_step_failed(&state, &e);
                self.release_claim(&state, true).await;
                return Err(e);
            }
        };

        if !workflow.enabled {
            tracing::debug!(
                execution_id = %state.execution_id,
                workflow_id = %state.workflow_id,
                "Workflow disabled, leaving scheduled step pending"
            );
            self.release_claim(&state, true).await;
            return Ok(RunOutcome::Skipped);
        }

        if !self.resource_exists(&workflow, &state.resource_id)? {
            tracing::info!(
                execution_id = %state.execution_id,
                resource_id = %state.resource_id,
                "Resource removed, cancelling scheduled step"
            );
            self.state_store.complete(&state.execution_id, node).await?;
            return Ok(RunOutcome::Cancelled);
        }

        self.drive(state, true).await
    }

    /// Drive a fresh execution from its current step (or the first step if it
    /// has none) until it completes or suspends. No record exists for it
    /// until it suspends.
    pub async fn run_workflow_task(&self, state: ExecutionState) -> WardenResult<RunOutcome> {
        self.drive(state, false).await
    }

    /// The step loop. `claimed` runs write back through the claim-fenced
    /// store operations.
    async fn drive(&self, state: ExecutionState, claimed: bool) -> WardenResult<RunOutcome> {
        let mut state = state;
        let mut executed = 0usize;

        loop {
            if executed >= self.config.max_inline_steps {
                tracing::error!(
                    execution_id = %state.execution_id,
                    limit = self.config.max_inline_steps,
                    "Inline step limit reached"
                );
                let err: WardenError = WorkflowError::InlineStepLimit {
                    execution_id: state.execution_id.clone(),
                    limit: self.config.max_inline_steps,
                }
                .into();
                self.listener.on_step_failed(&state, &err);
                self.release_claim(&state, claimed).await;
                return Err(err);
            }

            let outcome = match self.execute_step(&state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.listener.on_step_failed(&state, &e);
                    self.release_claim(&state, claimed).await;
                    return Err(e);
                }
            };
            executed += 1;
            if outcome.ran {
                self.listener.on_step_executed(&outcome.executed);
            }

            match (outcome.next, outcome.delay) {
                (None, _) => {
                    if claimed
                        && !self
                            .state_store
                            .complete(&state.execution_id, &self.config.node_id)
                            .await?
                    {
                        tracing::warn!(
                            execution_id = %state.execution_id,
                            "Claim lost before completion"
                        );
                    }
                    self.listener.on_workflow_completed(&outcome.executed);
                    return Ok(RunOutcome::Completed);
                }
                (Some(next), Some(delay)) => {
                    return self.schedule(&outcome.executed, &next, delay, claimed).await;
                }
                (Some(next), None) => {
                    if claimed && !self.holds_claim(&state.execution_id).await? {
                        tracing::info!(
                            execution_id = %state.execution_id,
                            next_step = %next.id,
                            "Execution cancelled while running, stopping"
                        );
                        return Ok(RunOutcome::Cancelled);
                    }
                    state = outcome.executed.with_step(next.id);
                }
            }
        }
    }

    /// Remove the scheduled record of `execution_id`. A trigger that fires
    /// afterwards is skipped.
    pub async fn cancel(&self, execution_id: &str) -> WardenResult<bool> {
        let removed = self.state_store.remove(execution_id).await?;
        if removed {
            tracing::info!(execution_id, "Workflow execution cancelled");
        }
        Ok(removed)
    }

    /// Cancel every execution on `resource_id`, e.g. after deleting it.
    pub async fn cancel_for_resource(&self, resource_id: &str) -> WardenResult<usize> {
        let removed = self.state_store.remove_by_resource(resource_id).await?;
        if removed > 0 {
            tracing::info!(resource_id, removed, "Workflow executions cancelled");
        }
        Ok(removed)
    }

    async fn schedule(
        &self,
        executed: &ExecutionState,
        next: &WorkflowStep,
        delay: std::time::Duration,
        claimed: bool,
    ) -> WardenResult<RunOutcome> {
        let at = scheduled_time(next, delay)?;
        let record = ScheduledStep::pending(executed, next.id.clone(), at);
        if !claimed {
            self.state_store.schedule(record).await?;
        } else if !self.state_store.reschedule(record, &self.config.node_id).await? {
            tracing::info!(
                execution_id = %executed.execution_id,
                next_step = %next.id,
                "Execution cancelled while running, not rescheduling"
            );
            return Ok(RunOutcome::Cancelled);
        }
        self.listener
            .on_step_scheduled(&executed.with_step(next.id.clone()), at);
        Ok(RunOutcome::Scheduled {
            step_id: next.id.clone(),
            at,
        })
    }

    async fn holds_claim(&self, execution_id: &str) -> WardenResult<bool> {
        Ok(self
            .state_store
            .get(execution_id)
            .await?
            .is_some_and(|record| record.is_claimed_by(&self.config.node_id)))
    }

    /// Hand a claimed record back for a later retry. Fresh runs have none.
    async fn release_claim(&self, state: &ExecutionState, claimed: bool) {
        if !claimed {
            return;
        }
        match self
            .state_store
            .release(&state.execution_id, &self.config.node_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    execution_id = %state.execution_id,
                    "Claim already gone, nothing to release"
                );
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %state.execution_id,
                    error = %e,
                    "Failed to release claim"
                );
            }
        }
    }

    /// Run one step in a fresh session, committing on success.
    async fn execute_step(&self, state: &ExecutionState) -> WardenResult<StepOutcome> {
        let mut session = self.sessions.open().await?;
        match self.run_in_session(state, session.as_mut()).await {
            Ok(outcome) => {
                session.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                session.rollback().await;
                Err(e)
            }
        }
    }

    async fn run_in_session(
        &self,
        state: &ExecutionState,
        session: &mut dyn StepSession,
    ) -> WardenResult<StepOutcome> {
        let workflow = session.load_workflow(&state.workflow_id).await?;

        let bound = match (&state.step_id, workflow.first_step()) {
            (Some(_), _) => state.clone(),
            (None, Some(first)) => state.with_step(first.id.clone()),
            (None, None) => {
                return Ok(StepOutcome {
                    executed: state.clone(),
                    next: None,
                    delay: None,
                    ran: false,
                })
            }
        };

        let mut ctx = DefaultExecutionContext::rehydrate(&bound, workflow)?;
        let step = ctx
            .current_step()
            .cloned()
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_id: bound.workflow_id.clone(),
                step_id: bound.step_id.clone().unwrap_or_default(),
            })?;
        let provider = self.providers.get(&step.provider_id)?;

        tracing::debug!(
            execution_id = %bound.execution_id,
            step_id = %step.id,
            provider_id = %step.provider_id,
            "Running workflow step"
        );
        provider.run(&step, &mut ctx, session).await?;

        let next = ctx.next_step().cloned();
        let delay = match &next {
            Some(next) => next.delay()?,
            None => None,
        };

        Ok(StepOutcome {
            executed: ctx.state(),
            next,
            delay,
            ran: true,
        })
    }

    async fn load_workflow(&self, workflow_id: &str) -> WardenResult<WorkflowDefinition> {
        let mut session = self.sessions.open().await?;
        let loaded = session.load_workflow(workflow_id).await;
        session.rollback().await;
        loaded
    }

    fn resource_exists(&self, workflow: &WorkflowDefinition, resource_id: &str) -> WardenResult<bool> {
        self.resources
            .require(&workflow.resource_type)?
            .exists(resource_id)
    }
}

impl std::fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("providers", &self.providers)
            .field("resources", &self.resources)
            .field("config", &self.config)
            .finish()
    }
}
