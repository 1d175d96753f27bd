//! Warden Test Utilities
//!
//! Centralized test infrastructure for the Warden workspace:
//! - Proptest generators for identifiers, revisions and duration strings
//! - Recording and failing step providers, a recording event listener and a
//!   call-counting identity store
//! - Test fixtures for common identity and workflow scenarios
//! - Custom assertions for Warden-specific validation

// Re-export core types for convenience
pub use warden_core::{
    CacheError, ClientModel, EntityId, EntityKind, GroupModel, IdentityProviderModel, RealmModel,
    Revision, RoleModel, StorageError, UserModel, UserSessionModel, WardenError, WardenResult,
    WorkflowError,
};
pub use warden_storage::{IdentityStore, InMemoryIdentityStore};
pub use warden_workflow::{
    ExecutionContext, ExecutionState, RunOutcome, StepProvider, StepSession, WorkflowDefinition,
    WorkflowEvent, WorkflowStep,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use warden_core::Timestamp;
use warden_workflow::{ResourceWrite, WorkflowEventListener};

// ============================================================================
// COUNTING IDENTITY STORE
// ============================================================================

/// [`InMemoryIdentityStore`] wrapper that counts client lookups by public
/// client id, the unit of work bounded by the role split budget.
#[derive(Debug, Default)]
pub struct CountingIdentityStore {
    inner: InMemoryIdentityStore,
    client_lookups: AtomicUsize,
}

impl CountingIdentityStore {
    pub fn new(inner: InMemoryIdentityStore) -> Self {
        Self {
            inner,
            client_lookups: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryIdentityStore {
        &self.inner
    }

    /// `client_by_client_id` calls since creation or the last reset.
    pub fn client_lookups(&self) -> usize {
        self.client_lookups.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.client_lookups.store(0, Ordering::SeqCst);
    }
}

impl IdentityStore for CountingIdentityStore {
    fn realm(&self, id: &str) -> WardenResult<Option<RealmModel>> {
        self.inner.realm(id)
    }

    fn role_by_id(&self, id: &str) -> WardenResult<Option<RoleModel>> {
        self.inner.role_by_id(id)
    }

    fn realm_role(&self, realm_id: &str, name: &str) -> WardenResult<Option<RoleModel>> {
        self.inner.realm_role(realm_id, name)
    }

    fn client_role(
        &self,
        realm_id: &str,
        client_internal_id: &str,
        name: &str,
    ) -> WardenResult<Option<RoleModel>> {
        self.inner.client_role(realm_id, client_internal_id, name)
    }

    fn client_by_id(&self, id: &str) -> WardenResult<Option<ClientModel>> {
        self.inner.client_by_id(id)
    }

    fn client_by_client_id(
        &self,
        realm_id: &str,
        client_id: &str,
    ) -> WardenResult<Option<ClientModel>> {
        self.client_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.client_by_client_id(realm_id, client_id)
    }

    fn clients(&self, realm_id: &str) -> WardenResult<Vec<ClientModel>> {
        self.inner.clients(realm_id)
    }

    fn group_by_id(&self, id: &str) -> WardenResult<Option<GroupModel>> {
        self.inner.group_by_id(id)
    }

    fn subgroups(&self, parent_id: &str) -> WardenResult<Vec<GroupModel>> {
        self.inner.subgroups(parent_id)
    }

    fn user_by_id(&self, id: &str) -> WardenResult<Option<UserModel>> {
        self.inner.user_by_id(id)
    }

    fn user_session_by_id(&self, id: &str) -> WardenResult<Option<UserSessionModel>> {
        self.inner.user_session_by_id(id)
    }

    fn identity_provider_by_id(
        &self,
        internal_id: &str,
    ) -> WardenResult<Option<IdentityProviderModel>> {
        self.inner.identity_provider_by_id(internal_id)
    }

    fn identity_provider_by_alias(
        &self,
        realm_id: &str,
        alias: &str,
    ) -> WardenResult<Option<IdentityProviderModel>> {
        self.inner.identity_provider_by_alias(realm_id, alias)
    }

    fn identity_providers(&self, realm_id: &str) -> WardenResult<Vec<IdentityProviderModel>> {
        self.inner.identity_providers(realm_id)
    }

    fn next_revision(&self) -> WardenResult<Revision> {
        self.inner.next_revision()
    }
}

// ============================================================================
// STEP PROVIDERS
// ============================================================================

/// Appends each executed step id to a trace. Clones share the trace.
#[derive(Debug, Clone)]
pub struct RecordingStepProvider {
    id: String,
    trace: Arc<Mutex<Vec<String>>>,
}

impl RecordingStepProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trace: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Step ids executed so far, in order.
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }

}

#[async_trait]
impl StepProvider for RecordingStepProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        _ctx: &mut dyn ExecutionContext,
        _session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        if let Ok(mut trace) = self.trace.lock() {
            trace.push(step.id.clone());
        }
        Ok(())
    }
}

/// Stages a write, optionally requests a restart, and then fails.
///
/// With [`failing_times`](Self::failing_times) it fails only the first `n`
/// attempts and succeeds afterwards, which models a transient fault.
#[derive(Debug)]
pub struct FailingStepProvider {
    id: String,
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
    restart_to: Option<i64>,
}

impl FailingStepProvider {
    /// Attribute staged on the resource before every failure.
    pub const TOUCHED_ATTRIBUTE: &'static str = "touched-by-failed-step";

    /// Fails every attempt.
    pub fn new(id: impl Into<String>) -> Self {
        Self::failing_times(id, usize::MAX)
    }

    pub fn failing_times(id: impl Into<String>, failures: usize) -> Self {
        Self {
            id: id.into(),
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            restart_to: None,
        }
    }

    /// Request `restart(position)` before failing.
    pub fn with_restart(mut self, position: i64) -> Self {
        self.restart_to = Some(position);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepProvider for FailingStepProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        step: &WorkflowStep,
        ctx: &mut dyn ExecutionContext,
        session: &mut dyn StepSession,
    ) -> WardenResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !should_fail {
            return Ok(());
        }

        session
            .stage(ResourceWrite::SetAttribute {
                resource_id: ctx.resource_id().to_string(),
                name: Self::TOUCHED_ATTRIBUTE.to_string(),
                value: step.id.clone(),
            })
            .await?;

        if let Some(position) = self.restart_to {
            if let Some(default) = ctx.as_default_mut() {
                default.restart(position)?;
            }
        }

        Err(WorkflowError::StepExecutionFailed {
            step_id: step.id.clone(),
            provider_id: self.id.clone(),
            reason: "injected failure".to_string(),
        }
        .into())
    }
}

// ============================================================================
// EVENT LISTENER
// ============================================================================

/// Keeps every workflow event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventListener {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Step ids from `StepExecuted` events, in order.
    pub fn executed_steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepExecuted { state } => state.step_id,
                _ => None,
            })
            .collect()
    }

    /// Step ids from `StepScheduled` events, in order.
    pub fn scheduled_steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepScheduled { state, .. } => state.step_id,
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(Option<String>, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepFailed { state, error } => Some((state.step_id, error)),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::WorkflowCompleted { .. }))
            .count()
    }

    fn push(&self, event: WorkflowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl WorkflowEventListener for RecordingEventListener {
    fn on_step_scheduled(&self, state: &ExecutionState, at: Timestamp) {
        self.push(WorkflowEvent::StepScheduled {
            state: state.clone(),
            at,
        });
    }

    fn on_step_executed(&self, state: &ExecutionState) {
        self.push(WorkflowEvent::StepExecuted {
            state: state.clone(),
        });
    }

    fn on_step_failed(&self, state: &ExecutionState, error: &WardenError) {
        self.push(WorkflowEvent::StepFailed {
            state: state.clone(),
            error: error.to_string(),
        });
    }

    fn on_workflow_completed(&self, state: &ExecutionState) {
        self.push(WorkflowEvent::WorkflowCompleted {
            state: state.clone(),
        });
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Warden types.

    use super::*;
    use proptest::prelude::*;

    /// Generate an entity id.
    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        "[a-z0-9]{8}"
    }

    /// Generate a positive revision.
    pub fn arb_revision() -> impl Strategy<Value = Revision> {
        1i64..10_000
    }

    /// Generate a sequence of revisions in arbitrary order.
    pub fn arb_revision_sequence(max_len: usize) -> impl Strategy<Value = Vec<Revision>> {
        prop::collection::vec(arb_revision(), 1..max_len)
    }

    /// Generate a role string with exactly `dots` separators.
    pub fn arb_dotted_role_name(dots: usize) -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z]{1,6}", dots + 1).prop_map(|parts| parts.join("."))
    }

    /// Generate a valid `after` duration string.
    pub fn arb_duration_string() -> impl Strategy<Value = String> {
        (0u32..10_000, prop_oneof![Just("ms"), Just("s"), Just("m"), Just("h"), Just("d")])
            .prop_map(|(n, unit)| format!("{n}{unit}"))
    }

    /// Generate a workflow of `1..max_steps` inline steps run by `provider_id`.
    pub fn arb_inline_workflow(
        provider_id: &'static str,
        max_steps: usize,
    ) -> impl Strategy<Value = WorkflowDefinition> {
        (1..max_steps).prop_map(move |n| fixtures::inline_workflow("wf-generated", provider_id, n))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built identity models and workflows for common scenarios.

    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use warden_core::ISSUER_CONFIG_KEY;
    use warden_workflow::{
        InMemoryResourceProvider, InMemoryResourceState, InMemorySessionFactory,
        InMemoryWorkflowRepository, InMemoryWorkflowStateStore, ResourceTypeRegistry,
        RunnerConfig, StepProviderRegistry, WorkflowRunner, WorkflowStateStore,
    };

    pub const REALM_ID: &str = "realm-test";

    pub fn realm() -> RealmModel {
        RealmModel {
            id: REALM_ID.to_string(),
            name: "test".to_string(),
            enabled: true,
        }
    }

    pub fn realm_role(name: &str) -> RoleModel {
        RoleModel {
            id: format!("role-{name}"),
            realm_id: REALM_ID.to_string(),
            name: name.to_string(),
            client_id: None,
            description: None,
            composite_ids: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn client(client_id: &str) -> ClientModel {
        ClientModel {
            id: format!("client-{client_id}"),
            realm_id: REALM_ID.to_string(),
            client_id: client_id.to_string(),
            name: None,
            enabled: true,
            attributes: BTreeMap::new(),
        }
    }

    pub fn client_with_attributes(client_id: &str, attributes: &[(&str, &str)]) -> ClientModel {
        ClientModel {
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..client(client_id)
        }
    }

    /// A role of `client`, which must come from [`client`].
    pub fn client_role(client: &ClientModel, name: &str) -> RoleModel {
        RoleModel {
            id: format!("{}-role-{name}", client.id),
            client_id: Some(client.id.clone()),
            ..realm_role(name)
        }
    }

    pub fn identity_provider(alias: &str, issuer: &str) -> IdentityProviderModel {
        IdentityProviderModel {
            internal_id: format!("idp-{alias}"),
            realm_id: REALM_ID.to_string(),
            alias: alias.to_string(),
            enabled: true,
            config: BTreeMap::from([(ISSUER_CONFIG_KEY.to_string(), issuer.to_string())]),
        }
    }

    pub fn group(name: &str, role_ids: &[&str]) -> GroupModel {
        GroupModel {
            id: format!("group-{name}"),
            realm_id: REALM_ID.to_string(),
            name: name.to_string(),
            parent_id: None,
            role_ids: role_ids.iter().map(|r| r.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn user(username: &str, role_ids: &[&str], group_ids: &[&str]) -> UserModel {
        UserModel {
            id: format!("user-{username}"),
            realm_id: REALM_ID.to_string(),
            username: username.to_string(),
            email: None,
            enabled: true,
            attributes: BTreeMap::new(),
            role_ids: role_ids.iter().map(|r| r.to_string()).collect(),
            group_ids: group_ids.iter().map(|g| g.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    /// A store holding the test realm only.
    pub fn identity_store() -> InMemoryIdentityStore {
        let store = InMemoryIdentityStore::new();
        // A fresh store cannot be poisoned.
        let _ = store.upsert_realm(realm());
        store
    }

    /// `n` inline steps `s0..s{n-1}`, all run by `provider_id`.
    pub fn inline_workflow(workflow_id: &str, provider_id: &str, n: usize) -> WorkflowDefinition {
        (0..n).fold(
            WorkflowDefinition::new(workflow_id, "Inline", "user"),
            |wf, i| wf.with_step(WorkflowStep::new(format!("s{i}"), provider_id)),
        )
    }

    /// Steps `A, B, C` without delays.
    pub fn three_step_workflow(provider_id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("three-steps", "Three steps", "user")
            .with_step(WorkflowStep::new("A", provider_id))
            .with_step(WorkflowStep::new("B", provider_id))
            .with_step(WorkflowStep::new("C", provider_id))
    }

    /// Step 0 runs after 10 minutes and step 1 after 5 more.
    pub fn delayed_workflow(provider_id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("delayed", "Delayed", "user")
            .with_step(WorkflowStep::new("first", provider_id).with_after("10m"))
            .with_step(WorkflowStep::new("second", provider_id).with_after("5m"))
    }

    /// Steps `A, B, C, D` where `B` is `b_provider` and the rest `provider_id`.
    pub fn four_step_workflow(provider_id: &str, b_provider: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("four-steps", "Four steps", "user")
            .with_step(WorkflowStep::new("A", provider_id))
            .with_step(WorkflowStep::new("B", b_provider))
            .with_step(WorkflowStep::new("C", provider_id))
            .with_step(WorkflowStep::new("D", provider_id))
    }

    /// A runner over in-memory sessions and resources with one `"user"`
    /// resource `r1`, a [`RecordingStepProvider`] registered as `"record"`
    /// and a [`RecordingEventListener`].
    pub struct WorkflowHarness {
        pub runner: Arc<WorkflowRunner>,
        pub state_store: Arc<dyn WorkflowStateStore>,
        pub sessions: InMemorySessionFactory,
        pub recorder: RecordingStepProvider,
        pub listener: Arc<RecordingEventListener>,
    }

    impl WorkflowHarness {
        pub const RESOURCE_ID: &'static str = "r1";
        pub const RECORDER_ID: &'static str = "record";

        pub fn new(workflows: Vec<WorkflowDefinition>) -> Self {
            Self::build(
                workflows,
                Vec::new(),
                Arc::new(InMemoryWorkflowStateStore::new()),
                RunnerConfig::default(),
            )
        }

        /// Full control over extra providers, the state store and config.
        pub fn build(
            workflows: Vec<WorkflowDefinition>,
            extra_providers: Vec<Arc<dyn StepProvider>>,
            state_store: Arc<dyn WorkflowStateStore>,
            config: RunnerConfig,
        ) -> Self {
            let repository = Arc::new(InMemoryWorkflowRepository::new());
            for workflow in workflows {
                if let Err(e) = repository.register(workflow) {
                    panic!("invalid fixture workflow: {e}");
                }
            }
            let resources = Arc::new(InMemoryResourceState::new());
            if let Err(e) = resources.insert("user", Self::RESOURCE_ID) {
                panic!("failed to seed resource: {e}");
            }

            let recorder = RecordingStepProvider::new(Self::RECORDER_ID);
            let providers = extra_providers.into_iter().fold(
                StepProviderRegistry::with_builtins().with(Arc::new(recorder.clone())),
                |registry, provider| registry.with(provider),
            );

            let sessions = InMemorySessionFactory::new(repository, resources.clone());
            let listener = Arc::new(RecordingEventListener::new());
            let runner = Arc::new(
                WorkflowRunner::new(
                    Arc::new(sessions.clone()),
                    state_store.clone(),
                    providers,
                    ResourceTypeRegistry::new()
                        .with(Arc::new(InMemoryResourceProvider::new("user", resources))),
                    config,
                )
                .with_listener(listener.clone()),
            );

            Self {
                runner,
                state_store,
                sessions,
                recorder,
                listener,
            }
        }

        pub fn resources(&self) -> &Arc<InMemoryResourceState> {
            self.sessions.resources()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Warden-specific validation.

    use super::*;

    /// Assert that a WardenResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &WardenResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a WardenResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &WardenResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_ambiguous<T: std::fmt::Debug>(result: &WardenResult<T>, expected_matches: usize) {
        match result {
            Err(WardenError::Cache(CacheError::AmbiguousResolution { matches, .. })) => {
                assert_eq!(*matches, expected_matches, "Wrong match count in ambiguity error");
            }
            other => panic!("Expected AmbiguousResolution error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_restart<T: std::fmt::Debug>(result: &Result<T, WorkflowError>) {
        match result {
            Err(WorkflowError::InvalidRestartPosition { .. }) => {}
            other => panic!("Expected InvalidRestartPosition error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_step_failed<T: std::fmt::Debug>(result: &WardenResult<T>, step_id: &str) {
        match result {
            Err(WardenError::Workflow(WorkflowError::StepExecutionFailed { step_id: id, .. })) => {
                assert_eq!(id, step_id, "Wrong step in StepExecutionFailed error");
            }
            other => panic!("Expected StepExecutionFailed for {step_id}, got: {:?}", other),
        }
    }

    /// Assert that an outcome suspended on `step_id`.
    #[track_caller]
    pub fn assert_scheduled(outcome: &RunOutcome, step_id: &str) {
        match outcome {
            RunOutcome::Scheduled { step_id: id, .. } => {
                assert_eq!(id, step_id, "Suspended on the wrong step");
            }
            other => panic!("Expected Scheduled({step_id}), got: {:?}", other),
        }
    }

    /// Assert that `revisions` never decrease.
    #[track_caller]
    pub fn assert_non_decreasing(revisions: &[Revision]) {
        for pair in revisions.windows(2) {
            assert!(
                pair[0] <= pair[1],
                "Revision decreased from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
