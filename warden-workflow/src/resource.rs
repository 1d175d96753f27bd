//! Resource types workflows run against.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use warden_core::{EntityId, WardenResult, WorkflowError};

use crate::session::InMemoryResourceState;

/// Whether a resource type has many instances or exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Collection,
    Singleton,
}

/// Answers which resources of one type exist.
pub trait ResourceTypeProvider: Send + Sync {
    fn resource_type(&self) -> &str;

    fn kind(&self) -> ResourceKind;

    fn exists(&self, resource_id: &str) -> WardenResult<bool>;

    /// Every resource of this type, e.g. for starting a workflow over all of
    /// them.
    fn resource_ids(&self) -> WardenResult<Vec<EntityId>>;
}

/// A resource type with exactly one instance.
#[derive(Debug, Clone)]
pub struct SingletonResource {
    resource_type: String,
    resource_id: EntityId,
}

impl SingletonResource {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<EntityId>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl ResourceTypeProvider for SingletonResource {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Singleton
    }

    fn exists(&self, resource_id: &str) -> WardenResult<bool> {
        Ok(resource_id == self.resource_id)
    }

    fn resource_ids(&self) -> WardenResult<Vec<EntityId>> {
        Ok(vec![self.resource_id.clone()])
    }
}

/// A collection resource type backed by [`InMemoryResourceState`].
#[derive(Debug, Clone)]
pub struct InMemoryResourceProvider {
    resource_type: String,
    state: Arc<InMemoryResourceState>,
}

impl InMemoryResourceProvider {
    pub fn new(resource_type: impl Into<String>, state: Arc<InMemoryResourceState>) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

impl ResourceTypeProvider for InMemoryResourceProvider {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Collection
    }

    fn exists(&self, resource_id: &str) -> WardenResult<bool> {
        Ok(self.state.contains(&self.resource_type, resource_id))
    }

    fn resource_ids(&self) -> WardenResult<Vec<EntityId>> {
        self.state.ids_of_type(&self.resource_type)
    }
}

/// Resource type providers by type name.
#[derive(Clone, Default)]
pub struct ResourceTypeRegistry {
    providers: HashMap<String, Arc<dyn ResourceTypeProvider>>,
}

impl ResourceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn ResourceTypeProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(
        &mut self,
        provider: Arc<dyn ResourceTypeProvider>,
    ) -> Option<Arc<dyn ResourceTypeProvider>> {
        self.providers
            .insert(provider.resource_type().to_string(), provider)
    }

    pub fn require(&self, resource_type: &str) -> Result<Arc<dyn ResourceTypeProvider>, WorkflowError> {
        self.providers
            .get(resource_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })
    }
}

impl fmt::Debug for ResourceTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.providers.keys().collect();
        types.sort();
        f.debug_struct("ResourceTypeRegistry")
            .field("resource_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton() {
        let realm = SingletonResource::new("realm", "master");
        assert_eq!(realm.kind(), ResourceKind::Singleton);
        assert!(realm.exists("master").unwrap());
        assert!(!realm.exists("other").unwrap());
        assert_eq!(realm.resource_ids().unwrap(), vec!["master".to_string()]);
    }

    #[test]
    fn test_in_memory_collection() {
        let state = Arc::new(InMemoryResourceState::new());
        state.insert("user", "u2").unwrap();
        state.insert("user", "u1").unwrap();
        state.insert("client", "c1").unwrap();

        let users = InMemoryResourceProvider::new("user", state.clone());
        assert_eq!(users.kind(), ResourceKind::Collection);
        assert!(users.exists("u1").unwrap());
        assert!(!users.exists("c1").unwrap());
        assert_eq!(
            users.resource_ids().unwrap(),
            vec!["u1".to_string(), "u2".to_string()]
        );

        state.remove("u1").unwrap();
        assert!(!users.exists("u1").unwrap());
    }

    #[test]
    fn test_registry_require() {
        let registry = ResourceTypeRegistry::new().with(Arc::new(SingletonResource::new("realm", "m")));
        assert_eq!(registry.require("realm").unwrap().kind(), ResourceKind::Singleton);
        assert!(matches!(
            registry.require("user"),
            Err(WorkflowError::UnknownResourceType { .. })
        ));
    }
}
