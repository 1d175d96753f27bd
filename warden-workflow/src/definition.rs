//! Workflow definitions: an ordered list of steps over one resource type.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use warden_core::{parse_delay, WorkflowError};

fn default_enabled() -> bool {
    true
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Identifier, unique within the workflow.
    pub id: String,
    /// Which [`StepProvider`](crate::StepProvider) executes this step.
    pub provider_id: String,
    /// Delay before this step runs, e.g. `"10m"`. Absent, zero or negative
    /// means the step runs inline right after its predecessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Provider-specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            after: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// The positive delay declared by `after`, if any.
    pub fn delay(&self) -> Result<Option<Duration>, WorkflowError> {
        match &self.after {
            Some(after) => parse_delay(after),
            None => Ok(None),
        }
    }
}

/// An ordered sequence of steps run against resources of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    /// Resource type the workflow operates on, e.g. `"user"`.
    pub resource_type: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl WorkflowDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            resource_type: resource_type.into(),
            steps: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Step at a 0-based position; negative or past-the-end positions are `None`.
    pub fn step_at(&self, position: i64) -> Option<&WorkflowStep> {
        usize::try_from(position)
            .ok()
            .and_then(|index| self.steps.get(index))
    }

    /// The step following `step_id` in declaration order.
    pub fn successor(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.step_index(step_id)
            .and_then(|index| self.steps.get(index + 1))
    }

    /// Check step ids are unique and non-empty and every `after` parses.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidDefinition {
            workflow_id: self.id.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step with empty id".to_string()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
            step.delay()?;
        }
        Ok(())
    }
}
