//! Warden Workflow - Resumable Multi-Step Workflows
//!
//! A workflow is an ordered list of steps run against one resource. Each step
//! executes in its own [`StepSession`] and commits before the next one is
//! chosen. Steps with an `after` delay suspend the run: the runner persists a
//! [`ScheduledStep`] in the [`WorkflowStateStore`] and returns, and the
//! [`scheduled_step_task`] resumes it once it is due.
//!
//! # Example
//!
//! ```ignore
//! let runner = Arc::new(WorkflowRunner::new(
//!     Arc::new(sessions),
//!     Arc::new(InMemoryWorkflowStateStore::new()),
//!     StepProviderRegistry::with_builtins(),
//!     resources,
//!     RunnerConfig::from_env(),
//! ));
//!
//! match runner.start("onboarding", "user-1").await? {
//!     RunOutcome::Scheduled { step_id, at } => tracing::info!(%step_id, %at, "suspended"),
//!     outcome => tracing::info!(?outcome, "finished inline"),
//! }
//! ```

pub mod context;
pub mod definition;
pub mod events;
pub mod provider;
pub mod resource;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod state;

pub use context::{require_default_context, DefaultExecutionContext, ExecutionContext, ExecutionState};
pub use definition::{WorkflowDefinition, WorkflowStep};
pub use events::{
    BroadcastEventListener, CompositeListener, NoopListener, TracingEventListener, WorkflowEvent,
    WorkflowEventListener,
};
pub use provider::{
    NotifyStepProvider, RestartStepProvider, SetAttributeStepProvider, StepProvider,
    StepProviderRegistry,
};
pub use resource::{
    InMemoryResourceProvider, ResourceKind, ResourceTypeProvider, ResourceTypeRegistry,
    SingletonResource,
};
pub use runner::{RunOutcome, RunnerConfig, WorkflowRunner};
pub use scheduler::{
    run_due_steps, scheduled_step_task, SchedulerConfig, SchedulerMetrics, SchedulerSnapshot,
};
pub use session::{
    InMemoryResourceState, InMemorySessionFactory, InMemoryWorkflowRepository, ResourceWrite,
    SessionFactory, StepSession,
};
pub use state::{
    ClaimStatus, InMemoryWorkflowStateStore, LmdbStateError, LmdbWorkflowStateStore,
    ScheduledStep, WorkflowStateStore,
};
