//! Step providers: the implementations behind `WorkflowStep::provider_id`.
//!
//! Providers are looked up in a [`StepProviderRegistry`] built by the caller
//! and handed to the runner; there is no global provider table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use warden_core::{WardenResult, WorkflowError};

use crate::context::{require_default_context, ExecutionContext};
use crate::definition::WorkflowStep;
use crate::session::{ResourceWrite, StepSession};

/// Executes one kind of workflow step.
///
/// A provider may be re-invoked from the same starting position after a
/// failure, so it must be safe to run again from scratch. Writes go through
/// `session` and are discarded if the step fails.
#[async_trait]
pub trait StepProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        session: &mut dyn StepSession,
    ) -> WardenResult<()>;
}

fn step_failed(step: &WorkflowStep, reason: impl Into<String>) -> WorkflowError {
    WorkflowError::StepExecutionFailed {
        step_id: step.id.clone(),
        provider_id: step.provider_id.clone(),
        reason: reason.into(),
    }
}

fn config_str<'a>(step: &'a WorkflowStep, key: &str) -> Result<&'a str, WorkflowError> {
    step.config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| step_failed(step, format!("missing string config \"{key}\"")))
}

// ============================================================================
// BUILT-IN PROVIDERS
// ============================================================================

/// Jumps to the step at config `position` (0-based) instead of advancing.
#[derive(Debug, Default)]
pub struct RestartStepProvider;

impl RestartStepProvider {
    pub const ID: &'static str = "restart";
}

#[async_trait]
impl StepProvider for RestartStepProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        _session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        let position = step
            .config
            .get("position")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| step_failed(step, "missing integer config \"position\""))?;

        let ctx = require_default_context(ctx, Self::ID)?;
        ctx.restart(position)?;
        tracing::debug!(step_id = %step.id, position, "Restart requested");
        Ok(())
    }
}

/// Sets attribute `name` to `value` on the execution's resource.
#[derive(Debug, Default)]
pub struct SetAttributeStepProvider;

impl SetAttributeStepProvider {
    pub const ID: &'static str = "set-attribute";
}

#[async_trait]
impl StepProvider for SetAttributeStepProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        let name = config_str(step, "name")?;
        let value = config_str(step, "value")?;
        session
            .stage(ResourceWrite::SetAttribute {
                resource_id: ctx.resource_id().to_string(),
                name: name.to_string(),
                value: value.to_string(),
            })
            .await
    }
}

/// Logs config `message` for the resource. Changes nothing.
#[derive(Debug, Default)]
pub struct NotifyStepProvider;

impl NotifyStepProvider {
    pub const ID: &'static str = "notify";
}

#[async_trait]
impl StepProvider for NotifyStepProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        _session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        let message = step
            .config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("workflow notification");
        tracing::info!(
            execution_id = %ctx.execution_id(),
            resource_id = %ctx.resource_id(),
            step_id = %step.id,
            message,
            "Workflow notification"
        );
        Ok(())
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Step providers by id.
#[derive(Clone, Default)]
pub struct StepProviderRegistry {
    providers: HashMap<String, Arc<dyn StepProvider>>,
}

impl StepProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `restart`, `set-attribute` and `notify`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with(Arc::new(RestartStepProvider))
            .with(Arc::new(SetAttributeStepProvider))
            .with(Arc::new(NotifyStepProvider))
    }

    pub fn with(mut self, provider: Arc<dyn StepProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Add `provider`, returning the one it replaced.
    pub fn register(&mut self, provider: Arc<dyn StepProvider>) -> Option<Arc<dyn StepProvider>> {
        self.providers.insert(provider.id().to_string(), provider)
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn StepProvider>, WorkflowError> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownStepProvider {
                provider_id: provider_id.to_string(),
            })
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }
}

impl fmt::Debug for StepProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.providers.keys().collect();
        ids.sort();
        f.debug_struct("StepProviderRegistry")
            .field("providers", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DefaultExecutionContext;
    use crate::definition::WorkflowDefinition;
    use crate::session::{
        InMemoryResourceState, InMemorySessionFactory, InMemoryWorkflowRepository,
        SessionFactory,
    };
    use serde_json::json;

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Test", "user")
            .with_step(WorkflowStep::new("a", "notify"))
            .with_step(WorkflowStep::new("b", "restart").with_config(json!({"position": 0})))
            .with_step(WorkflowStep::new("c", "notify"))
    }

    fn sessions() -> InMemorySessionFactory {
        let resources = Arc::new(InMemoryResourceState::new());
        resources.insert("user", "u1").unwrap();
        InMemorySessionFactory::new(Arc::new(InMemoryWorkflowRepository::new()), resources)
    }

    #[tokio::test]
    async fn test_restart_provider_sets_position() {
        let sessions = sessions();
        let mut session = sessions.open().await.unwrap();
        let mut ctx = DefaultExecutionContext::new(workflow(), "u1");
        let step = workflow().steps[1].clone();

        RestartStepProvider
            .run(&step, &mut ctx, session.as_mut())
            .await
            .unwrap();
        assert_eq!(ctx.next_step().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_restart_provider_rejects_out_of_range() {
        let sessions = sessions();
        let mut session = sessions.open().await.unwrap();
        let mut ctx = DefaultExecutionContext::new(workflow(), "u1");
        let step = WorkflowStep::new("x", "restart").with_config(json!({"position": 7}));

        let err = RestartStepProvider
            .run(&step, &mut ctx, session.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            warden_core::WardenError::Workflow(WorkflowError::InvalidRestartPosition { .. })
        ));
        assert!(ctx.restart_position().is_none());
    }

    #[tokio::test]
    async fn test_set_attribute_provider_stages_write() {
        let sessions = sessions();
        let mut session = sessions.open().await.unwrap();
        let mut ctx = DefaultExecutionContext::new(workflow(), "u1");
        let step = WorkflowStep::new("s", "set-attribute")
            .with_config(json!({"name": "status", "value": "welcomed"}));

        SetAttributeStepProvider
            .run(&step, &mut ctx, session.as_mut())
            .await
            .unwrap();
        session.commit().await.unwrap();
        assert_eq!(
            sessions.resources().attribute("u1", "status").as_deref(),
            Some("welcomed")
        );
    }

    #[tokio::test]
    async fn test_set_attribute_provider_missing_config() {
        let sessions = sessions();
        let mut session = sessions.open().await.unwrap();
        let mut ctx = DefaultExecutionContext::new(workflow(), "u1");
        let step = WorkflowStep::new("s", "set-attribute").with_config(json!({"name": "x"}));

        let err = SetAttributeStepProvider
            .run(&step, &mut ctx, session.as_mut())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            warden_core::WardenError::Workflow(WorkflowError::StepExecutionFailed { .. })
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StepProviderRegistry::with_builtins();
        assert!(registry.contains("restart"));
        assert!(registry.contains("set-attribute"));
        assert_eq!(registry.get("notify").unwrap().id(), "notify");
        assert!(matches!(
            registry.get("email"),
            Err(WorkflowError::UnknownStepProvider { .. })
        ));
    }
}
