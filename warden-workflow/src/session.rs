//! Step sessions: the short transaction each workflow step runs in.
//!
//! The runner opens one [`StepSession`] per step, loads the workflow through
//! it, lets the step provider stage writes, and then commits or rolls back.
//! A failed step therefore leaves no trace in the resource state.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use warden_core::{EntityId, StorageError, WardenResult, WorkflowError};

use crate::definition::WorkflowDefinition;

fn poisoned<T>(_: T) -> StorageError {
    StorageError::LockPoisoned
}

/// A write against a workflow resource, applied on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceWrite {
    SetAttribute {
        resource_id: EntityId,
        name: String,
        value: String,
    },
    RemoveAttribute {
        resource_id: EntityId,
        name: String,
    },
}

impl ResourceWrite {
    pub fn resource_id(&self) -> &str {
        match self {
            ResourceWrite::SetAttribute { resource_id, .. }
            | ResourceWrite::RemoveAttribute { resource_id, .. } => resource_id,
        }
    }
}

/// One open transaction.
#[async_trait]
pub trait StepSession: Send {
    /// Load a workflow definition within this session.
    async fn load_workflow(&mut self, workflow_id: &str) -> WardenResult<WorkflowDefinition>;

    /// Stage a write; nothing is visible until [`commit`](Self::commit).
    async fn stage(&mut self, write: ResourceWrite) -> WardenResult<()>;

    async fn commit(self: Box<Self>) -> WardenResult<()>;

    async fn rollback(self: Box<Self>);
}

/// Opens step sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> WardenResult<Box<dyn StepSession>>;
}

// ============================================================================
// WORKFLOW REPOSITORY
// ============================================================================

/// Workflow definitions by id.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store `workflow`, replacing any previous version.
    pub fn register(&self, workflow: WorkflowDefinition) -> WardenResult<()> {
        workflow.validate()?;
        self.workflows
            .write()
            .map_err(poisoned)?
            .insert(workflow.id.clone(), workflow);
        Ok(())
    }

    pub fn remove(&self, workflow_id: &str) -> WardenResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.write().map_err(poisoned)?.remove(workflow_id))
    }

    pub fn get(&self, workflow_id: &str) -> WardenResult<WorkflowDefinition> {
        self.workflows
            .read()
            .map_err(poisoned)?
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::UnknownWorkflow {
                    workflow_id: workflow_id.to_string(),
                }
                .into()
            })
    }

    /// Enabled workflows over `resource_type`.
    pub fn for_resource_type(&self, resource_type: &str) -> WardenResult<Vec<WorkflowDefinition>> {
        let mut matching: Vec<_> = self
            .workflows
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|w| w.enabled && w.resource_type == resource_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    pub fn len(&self) -> usize {
        self.workflows.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// RESOURCE STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceRecord {
    resource_type: String,
    attributes: BTreeMap<String, String>,
}

/// Resources workflows run against, with string attributes.
#[derive(Debug, Default)]
pub struct InMemoryResourceState {
    resources: RwLock<HashMap<EntityId, ResourceRecord>>,
}

impl InMemoryResourceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        resource_type: impl Into<String>,
        resource_id: impl Into<EntityId>,
    ) -> WardenResult<()> {
        self.resources.write().map_err(poisoned)?.insert(
            resource_id.into(),
            ResourceRecord {
                resource_type: resource_type.into(),
                attributes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn remove(&self, resource_id: &str) -> WardenResult<bool> {
        Ok(self
            .resources
            .write()
            .map_err(poisoned)?
            .remove(resource_id)
            .is_some())
    }

    pub fn contains(&self, resource_type: &str, resource_id: &str) -> bool {
        self.resources
            .read()
            .map(|r| {
                r.get(resource_id)
                    .is_some_and(|record| record.resource_type == resource_type)
            })
            .unwrap_or(false)
    }

    /// Ids of every resource of `resource_type`, sorted.
    pub fn ids_of_type(&self, resource_type: &str) -> WardenResult<Vec<EntityId>> {
        let mut ids: Vec<_> = self
            .resources
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|(_, record)| record.resource_type == resource_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn attribute(&self, resource_id: &str, name: &str) -> Option<String> {
        self.resources
            .read()
            .ok()?
            .get(resource_id)?
            .attributes
            .get(name)
            .cloned()
    }

    /// Apply `writes` all-or-nothing.
    fn apply(&self, writes: &[ResourceWrite]) -> WardenResult<()> {
        let mut resources = self.resources.write().map_err(poisoned)?;

        if let Some(missing) = writes
            .iter()
            .find(|w| !resources.contains_key(w.resource_id()))
        {
            return Err(StorageError::TransactionFailed {
                reason: format!("resource {} no longer exists", missing.resource_id()),
            }
            .into());
        }

        for write in writes {
            match write {
                ResourceWrite::SetAttribute {
                    resource_id,
                    name,
                    value,
                } => {
                    if let Some(record) = resources.get_mut(resource_id) {
                        record.attributes.insert(name.clone(), value.clone());
                    }
                }
                ResourceWrite::RemoveAttribute { resource_id, name } => {
                    if let Some(record) = resources.get_mut(resource_id) {
                        record.attributes.remove(name);
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY SESSIONS
// ============================================================================

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// Session factory over an [`InMemoryWorkflowRepository`] and an
/// [`InMemoryResourceState`].
#[derive(Debug, Clone)]
pub struct InMemorySessionFactory {
    workflows: Arc<InMemoryWorkflowRepository>,
    resources: Arc<InMemoryResourceState>,
    counters: Arc<SessionCounters>,
}

impl InMemorySessionFactory {
    pub fn new(
        workflows: Arc<InMemoryWorkflowRepository>,
        resources: Arc<InMemoryResourceState>,
    ) -> Self {
        Self {
            workflows,
            resources,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    pub fn workflows(&self) -> &Arc<InMemoryWorkflowRepository> {
        &self.workflows
    }

    pub fn resources(&self) -> &Arc<InMemoryResourceState> {
        &self.resources
    }

    pub fn sessions_opened(&self) -> u64 {
        self.counters.opened.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.counters.committed.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.counters.rolled_back.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionFactory for InMemorySessionFactory {
    async fn open(&self) -> WardenResult<Box<dyn StepSession>> {
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemorySession {
            workflows: self.workflows.clone(),
            resources: self.resources.clone(),
            counters: self.counters.clone(),
            staged: Vec::new(),
        }))
    }
}

struct InMemorySession {
    workflows: Arc<InMemoryWorkflowRepository>,
    resources: Arc<InMemoryResourceState>,
    counters: Arc<SessionCounters>,
    staged: Vec<ResourceWrite>,
}

#[async_trait]
impl StepSession for InMemorySession {
    async fn load_workflow(&mut self, workflow_id: &str) -> WardenResult<WorkflowDefinition> {
        self.workflows.get(workflow_id)
    }

    async fn stage(&mut self, write: ResourceWrite) -> WardenResult<()> {
        self.staged.push(write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> WardenResult<()> {
        self.resources.apply(&self.staged)?;
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
    }
}
