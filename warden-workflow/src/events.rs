//! Observability hooks fired synchronously by the runner.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use warden_core::{Timestamp, WardenError};

use crate::context::ExecutionState;

/// Receives workflow lifecycle notifications. Every hook defaults to a no-op.
pub trait WorkflowEventListener: Send + Sync {
    /// `state` was persisted to resume at `state.step_id` at `at`.
    fn on_step_scheduled(&self, _state: &ExecutionState, _at: Timestamp) {}

    /// The step `state.step_id` ran and committed.
    fn on_step_executed(&self, _state: &ExecutionState) {}

    /// The step `state.step_id` failed and was rolled back.
    fn on_step_failed(&self, _state: &ExecutionState, _error: &WardenError) {}

    fn on_workflow_completed(&self, _state: &ExecutionState) {}
}

/// A listener that ignores everything.
#[derive(Debug, Default)]
pub struct NoopListener;

impl WorkflowEventListener for NoopListener {}

/// Logs every hook through `tracing`; failures at `error`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl WorkflowEventListener for TracingEventListener {
    fn on_step_scheduled(&self, state: &ExecutionState, at: Timestamp) {
        tracing::info!(
            execution_id = %state.execution_id,
            workflow_id = %state.workflow_id,
            resource_id = %state.resource_id,
            step_id = ?state.step_id,
            scheduled_at = %at,
            "Workflow step scheduled"
        );
    }

    fn on_step_executed(&self, state: &ExecutionState) {
        tracing::debug!(
            execution_id = %state.execution_id,
            workflow_id = %state.workflow_id,
            step_id = ?state.step_id,
            "Workflow step executed"
        );
    }

    fn on_step_failed(&self, state: &ExecutionState, error: &WardenError) {
        tracing::error!(
            execution_id = %state.execution_id,
            workflow_id = %state.workflow_id,
            resource_id = %state.resource_id,
            step_id = ?state.step_id,
            error = %error,
            "Workflow step failed"
        );
    }

    fn on_workflow_completed(&self, state: &ExecutionState) {
        tracing::info!(
            execution_id = %state.execution_id,
            workflow_id = %state.workflow_id,
            resource_id = %state.resource_id,
            "Workflow completed"
        );
    }
}

/// A lifecycle notification as sent on a [`BroadcastEventListener`] channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepScheduled {
        state: ExecutionState,
        at: Timestamp,
    },
    StepExecuted {
        state: ExecutionState,
    },
    StepFailed {
        state: ExecutionState,
        error: String,
    },
    WorkflowCompleted {
        state: ExecutionState,
    },
}

/// Republishes hooks as [`WorkflowEvent`]s on a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventListener {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    fn send(&self, event: WorkflowEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl WorkflowEventListener for BroadcastEventListener {
    fn on_step_scheduled(&self, state: &ExecutionState, at: Timestamp) {
        self.send(WorkflowEvent::StepScheduled {
            state: state.clone(),
            at,
        });
    }

    fn on_step_executed(&self, state: &ExecutionState) {
        self.send(WorkflowEvent::StepExecuted {
            state: state.clone(),
        });
    }

    fn on_step_failed(&self, state: &ExecutionState, error: &WardenError) {
        self.send(WorkflowEvent::StepFailed {
            state: state.clone(),
            error: error.to_string(),
        });
    }

    fn on_workflow_completed(&self, state: &ExecutionState) {
        self.send(WorkflowEvent::WorkflowCompleted {
            state: state.clone(),
        });
    }
}

/// Fans every hook out to several listeners in order.
#[derive(Clone, Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn WorkflowEventListener>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn WorkflowEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl WorkflowEventListener for CompositeListener {
    fn on_step_scheduled(&self, state: &ExecutionState, at: Timestamp) {
        for listener in &self.listeners {
            listener.on_step_scheduled(state, at);
        }
    }

    fn on_step_executed(&self, state: &ExecutionState) {
        for listener in &self.listeners {
            listener.on_step_executed(state);
        }
    }

    fn on_step_failed(&self, state: &ExecutionState, error: &WardenError) {
        for listener in &self.listeners {
            listener.on_step_failed(state, error);
        }
    }

    fn on_workflow_completed(&self, state: &ExecutionState) {
        for listener in &self.listeners {
            listener.on_workflow_completed(state);
        }
    }
}

impl std::fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
