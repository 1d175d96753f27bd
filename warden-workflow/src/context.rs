//! Execution contexts.
//!
//! An [`ExecutionState`] is the plain value that crosses step and transaction
//! boundaries. A [`DefaultExecutionContext`] is rebuilt from it for every step
//! with a workflow definition freshly loaded by that step's session, so no
//! live reference ever outlives the session that produced it.

use serde::{Deserialize, Serialize};

use warden_core::{new_entity_id, EntityId, WorkflowError};

use crate::definition::{WorkflowDefinition, WorkflowStep};

/// Identity and position of one execution, safe to persist or move between
/// threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub resource_id: EntityId,
    /// Current step, `None` before the first step has run.
    pub step_id: Option<String>,
}

impl ExecutionState {
    /// A fresh execution with a random execution id.
    pub fn new(workflow_id: impl Into<String>, resource_id: impl Into<EntityId>) -> Self {
        Self {
            execution_id: new_entity_id(),
            workflow_id: workflow_id.into(),
            resource_id: resource_id.into(),
            step_id: None,
        }
    }

    /// Same execution, positioned on `step_id`.
    pub fn with_step(&self, step_id: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..self.clone()
        }
    }
}

/// What a step provider sees of the execution it runs in.
pub trait ExecutionContext: Send + Sync {
    fn execution_id(&self) -> &str;

    fn resource_id(&self) -> &str;

    fn workflow(&self) -> &WorkflowDefinition;

    fn current_step(&self) -> Option<&WorkflowStep>;

    /// Downcast to the standard context, which is the only one that supports
    /// restarts.
    fn as_default_mut(&mut self) -> Option<&mut DefaultExecutionContext> {
        None
    }
}

/// The standard execution context.
#[derive(Debug, Clone)]
pub struct DefaultExecutionContext {
    execution_id: String,
    resource_id: EntityId,
    workflow: WorkflowDefinition,
    current: Option<usize>,
    restart_position: Option<usize>,
}

impl DefaultExecutionContext {
    /// A context for a new execution that has not run any step.
    pub fn new(workflow: WorkflowDefinition, resource_id: impl Into<EntityId>) -> Self {
        Self {
            execution_id: new_entity_id(),
            resource_id: resource_id.into(),
            workflow,
            current: None,
            restart_position: None,
        }
    }

    /// Rebuild a context from its persisted state against a workflow loaded
    /// in the current session.
    pub fn rehydrate(
        state: &ExecutionState,
        workflow: WorkflowDefinition,
    ) -> Result<Self, WorkflowError> {
        let current = match &state.step_id {
            Some(step_id) => Some(workflow.step_index(step_id).ok_or_else(|| {
                WorkflowError::StepNotFound {
                    workflow_id: workflow.id.clone(),
                    step_id: step_id.clone(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            execution_id: state.execution_id.clone(),
            resource_id: state.resource_id.clone(),
            workflow,
            current,
            restart_position: None,
        })
    }

    /// Request that the next step be the one at `position` (0-based) instead
    /// of the successor of the current step.
    ///
    /// Out-of-range positions are rejected here and leave the context
    /// untouched.
    pub fn restart(&mut self, position: i64) -> Result<(), WorkflowError> {
        let step_count = self.workflow.step_count();
        match usize::try_from(position) {
            Ok(index) if index < step_count => {
                self.restart_position = Some(index);
                Ok(())
            }
            _ => Err(WorkflowError::InvalidRestartPosition {
                position,
                step_count,
            }),
        }
    }

    pub fn restart_position(&self) -> Option<usize> {
        self.restart_position
    }

    /// The step to run after the current one.
    ///
    /// A pending restart wins; otherwise a context that has not started yields
    /// the first step and a started one yields the successor.
    pub fn next_step(&self) -> Option<&WorkflowStep> {
        if let Some(position) = self.restart_position {
            return self.workflow.steps.get(position);
        }
        match self.current {
            None => self.workflow.first_step(),
            Some(index) => self.workflow.steps.get(index + 1),
        }
    }

    pub fn state(&self) -> ExecutionState {
        ExecutionState {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow.id.clone(),
            resource_id: self.resource_id.clone(),
            step_id: self.current_step().map(|s| s.id.clone()),
        }
    }
}

impl ExecutionContext for DefaultExecutionContext {
    fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    fn current_step(&self) -> Option<&WorkflowStep> {
        self.current.and_then(|index| self.workflow.steps.get(index))
    }

    fn as_default_mut(&mut self) -> Option<&mut DefaultExecutionContext> {
        Some(self)
    }
}

/// Borrow `ctx` as the standard context or fail with
/// [`WorkflowError::UnsupportedContextType`].
pub fn require_default_context<'a>(
    ctx: &'a mut dyn ExecutionContext,
    provider_id: &str,
) -> Result<&'a mut DefaultExecutionContext, WorkflowError> {
    ctx.as_default_mut()
        .ok_or_else(|| WorkflowError::UnsupportedContextType {
            provider_id: provider_id.to_string(),
            expected: "DefaultExecutionContext".to_string(),
        })
}
