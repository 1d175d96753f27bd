//! Warden Storage - Identity Store Trait and Revision-Based Cache
//!
//! Defines the persistence collaborator the cache reads through
//! ([`IdentityStore`]), an in-memory implementation of it, and the
//! [`cache`] module with revisioned entries, lazy loaders, cluster
//! invalidation and alternative-lookup resolution.

pub mod cache;

pub use cache::{
    invalidation_listener_task, AlternativeLookupCache, BroadcastInvalidationBus, CacheConfig,
    CacheStats, CachedClient, CachedGroup, CachedIdentityProvider, CachedRole, CachedUser,
    CachedUserSession, CachedValue, IdentityCache, InvalidationAction, InvalidationBus,
    InvalidationMessage, LazyLoader, LookupCategory, LookupKey, LookupResult, PutOutcome,
    Revisioned, RevisionedCacheStore, RevisionedEntry,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use warden_core::{
    ClientModel, EntityId, GroupModel, IdentityProviderModel, RealmModel, Revision, RoleModel,
    StorageError, UserModel, UserSessionModel, WardenResult,
};

// ============================================================================
// IDENTITY STORE TRAIT
// ============================================================================

/// Live-model accessor for the identity store.
///
/// This is the source of truth the cache reads through. Implementations are
/// expected to be cheap to call concurrently; the cache never holds one of
/// its own locks while calling into the store.
pub trait IdentityStore: Send + Sync {
    // === Realms ===

    /// Get a realm by id.
    fn realm(&self, id: &str) -> WardenResult<Option<RealmModel>>;

    // === Roles ===

    /// Get a role by id.
    fn role_by_id(&self, id: &str) -> WardenResult<Option<RoleModel>>;

    /// Get a realm role by name.
    fn realm_role(&self, realm_id: &str, name: &str) -> WardenResult<Option<RoleModel>>;

    /// Get a client role by its owning client's internal id and role name.
    fn client_role(
        &self,
        realm_id: &str,
        client_internal_id: &str,
        name: &str,
    ) -> WardenResult<Option<RoleModel>>;

    // === Clients ===

    /// Get a client by internal id.
    fn client_by_id(&self, id: &str) -> WardenResult<Option<ClientModel>>;

    /// Get a client by its public client id.
    fn client_by_client_id(&self, realm_id: &str, client_id: &str)
        -> WardenResult<Option<ClientModel>>;

    /// List all clients of a realm.
    fn clients(&self, realm_id: &str) -> WardenResult<Vec<ClientModel>>;

    // === Groups, users, sessions ===

    /// Get a group by id.
    fn group_by_id(&self, id: &str) -> WardenResult<Option<GroupModel>>;

    /// List the direct subgroups of a group.
    fn subgroups(&self, parent_id: &str) -> WardenResult<Vec<GroupModel>>;

    /// Get a user by id.
    fn user_by_id(&self, id: &str) -> WardenResult<Option<UserModel>>;

    /// Get a user session by id.
    fn user_session_by_id(&self, id: &str) -> WardenResult<Option<UserSessionModel>>;

    // === Identity providers ===

    /// Get an identity provider by internal id.
    fn identity_provider_by_id(&self, internal_id: &str)
        -> WardenResult<Option<IdentityProviderModel>>;

    /// Get an identity provider by alias.
    fn identity_provider_by_alias(
        &self,
        realm_id: &str,
        alias: &str,
    ) -> WardenResult<Option<IdentityProviderModel>>;

    /// List all identity providers of a realm.
    fn identity_providers(&self, realm_id: &str) -> WardenResult<Vec<IdentityProviderModel>>;

    // === Versioning ===

    /// Allocate the revision stamped on a mutation's invalidation.
    ///
    /// Every node reading this store draws from the same sequence, so
    /// revisions published by different nodes are comparable. The result is
    /// strictly greater than every revision handed out before.
    fn next_revision(&self) -> WardenResult<Revision>;
}

/// Monotonic revision counter backing [`InMemoryIdentityStore`].
#[derive(Debug, Default)]
pub struct MonotonicRevisionSource {
    counter: AtomicI64,
}

impl MonotonicRevisionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_revision(&self) -> Revision {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ============================================================================
// IN-MEMORY IDENTITY STORE
// ============================================================================

/// In-memory identity store for tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryIdentityStore {
    realms: Arc<RwLock<HashMap<EntityId, RealmModel>>>,
    roles: Arc<RwLock<HashMap<EntityId, RoleModel>>>,
    clients: Arc<RwLock<HashMap<EntityId, ClientModel>>>,
    groups: Arc<RwLock<HashMap<EntityId, GroupModel>>>,
    users: Arc<RwLock<HashMap<EntityId, UserModel>>>,
    sessions: Arc<RwLock<HashMap<EntityId, UserSessionModel>>>,
    identity_providers: Arc<RwLock<HashMap<EntityId, IdentityProviderModel>>>,
    revisions: Arc<MonotonicRevisionSource>,
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::LockPoisoned
}

impl InMemoryIdentityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_realm(&self, realm: RealmModel) -> WardenResult<()> {
        self.realms
            .write()
            .map_err(poisoned)?
            .insert(realm.id.clone(), realm);
        Ok(())
    }

    pub fn upsert_role(&self, role: RoleModel) -> WardenResult<()> {
        self.roles
            .write()
            .map_err(poisoned)?
            .insert(role.id.clone(), role);
        Ok(())
    }

    /// Remove a role and every composite/mapping reference to it.
    pub fn remove_role(&self, id: &str) -> WardenResult<Option<RoleModel>> {
        let removed = self.roles.write().map_err(poisoned)?.remove(id);
        if removed.is_some() {
            for role in self.roles.write().map_err(poisoned)?.values_mut() {
                role.composite_ids.remove(id);
            }
            for group in self.groups.write().map_err(poisoned)?.values_mut() {
                group.role_ids.remove(id);
            }
            for user in self.users.write().map_err(poisoned)?.values_mut() {
                user.role_ids.remove(id);
            }
        }
        Ok(removed)
    }

    pub fn upsert_client(&self, client: ClientModel) -> WardenResult<()> {
        self.clients
            .write()
            .map_err(poisoned)?
            .insert(client.id.clone(), client);
        Ok(())
    }

    pub fn remove_client(&self, id: &str) -> WardenResult<Option<ClientModel>> {
        Ok(self.clients.write().map_err(poisoned)?.remove(id))
    }

    pub fn upsert_group(&self, group: GroupModel) -> WardenResult<()> {
        self.groups
            .write()
            .map_err(poisoned)?
            .insert(group.id.clone(), group);
        Ok(())
    }

    pub fn upsert_user(&self, user: UserModel) -> WardenResult<()> {
        self.users
            .write()
            .map_err(poisoned)?
            .insert(user.id.clone(), user);
        Ok(())
    }

    pub fn remove_user(&self, id: &str) -> WardenResult<Option<UserModel>> {
        Ok(self.users.write().map_err(poisoned)?.remove(id))
    }

    pub fn upsert_user_session(&self, session: UserSessionModel) -> WardenResult<()> {
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert(session.id.clone(), session);
        Ok(())
    }

    pub fn upsert_identity_provider(&self, idp: IdentityProviderModel) -> WardenResult<()> {
        self.identity_providers
            .write()
            .map_err(poisoned)?
            .insert(idp.internal_id.clone(), idp);
        Ok(())
    }

    /// Number of stored roles.
    pub fn role_count(&self) -> usize {
        self.roles.read().map(|r| r.len()).unwrap_or(0)
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn realm(&self, id: &str) -> WardenResult<Option<RealmModel>> {
        Ok(self.realms.read().map_err(poisoned)?.get(id).cloned())
    }

    fn role_by_id(&self, id: &str) -> WardenResult<Option<RoleModel>> {
        Ok(self.roles.read().map_err(poisoned)?.get(id).cloned())
    }

    fn realm_role(&self, realm_id: &str, name: &str) -> WardenResult<Option<RoleModel>> {
        let roles = self.roles.read().map_err(poisoned)?;
        Ok(roles
            .values()
            .find(|r| r.realm_id == realm_id && r.client_id.is_none() && r.name == name)
            .cloned())
    }

    fn client_role(
        &self,
        realm_id: &str,
        client_internal_id: &str,
        name: &str,
    ) -> WardenResult<Option<RoleModel>> {
        let roles = self.roles.read().map_err(poisoned)?;
        Ok(roles
            .values()
            .find(|r| {
                r.realm_id == realm_id
                    && r.client_id.as_deref() == Some(client_internal_id)
                    && r.name == name
            })
            .cloned())
    }

    fn client_by_id(&self, id: &str) -> WardenResult<Option<ClientModel>> {
        Ok(self.clients.read().map_err(poisoned)?.get(id).cloned())
    }

    fn client_by_client_id(
        &self,
        realm_id: &str,
        client_id: &str,
    ) -> WardenResult<Option<ClientModel>> {
        let clients = self.clients.read().map_err(poisoned)?;
        Ok(clients
            .values()
            .find(|c| c.realm_id == realm_id && c.client_id == client_id)
            .cloned())
    }

    fn clients(&self, realm_id: &str) -> WardenResult<Vec<ClientModel>> {
        let clients = self.clients.read().map_err(poisoned)?;
        let mut result: Vec<ClientModel> = clients
            .values()
            .filter(|c| c.realm_id == realm_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(result)
    }

    fn group_by_id(&self, id: &str) -> WardenResult<Option<GroupModel>> {
        Ok(self.groups.read().map_err(poisoned)?.get(id).cloned())
    }

    fn subgroups(&self, parent_id: &str) -> WardenResult<Vec<GroupModel>> {
        let groups = self.groups.read().map_err(poisoned)?;
        let mut result: Vec<GroupModel> = groups
            .values()
            .filter(|g| g.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn user_by_id(&self, id: &str) -> WardenResult<Option<UserModel>> {
        Ok(self.users.read().map_err(poisoned)?.get(id).cloned())
    }

    fn user_session_by_id(&self, id: &str) -> WardenResult<Option<UserSessionModel>> {
        Ok(self.sessions.read().map_err(poisoned)?.get(id).cloned())
    }

    fn identity_provider_by_id(
        &self,
        internal_id: &str,
    ) -> WardenResult<Option<IdentityProviderModel>> {
        Ok(self
            .identity_providers
            .read()
            .map_err(poisoned)?
            .get(internal_id)
            .cloned())
    }

    fn identity_provider_by_alias(
        &self,
        realm_id: &str,
        alias: &str,
    ) -> WardenResult<Option<IdentityProviderModel>> {
        let idps = self.identity_providers.read().map_err(poisoned)?;
        Ok(idps
            .values()
            .find(|i| i.realm_id == realm_id && i.alias == alias)
            .cloned())
    }

    fn identity_providers(&self, realm_id: &str) -> WardenResult<Vec<IdentityProviderModel>> {
        let idps = self.identity_providers.read().map_err(poisoned)?;
        let mut result: Vec<IdentityProviderModel> = idps
            .values()
            .filter(|i| i.realm_id == realm_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(result)
    }

    fn next_revision(&self) -> WardenResult<Revision> {
        Ok(self.revisions.next_revision())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn role(id: &str, name: &str, client_id: Option<&str>) -> RoleModel {
        RoleModel {
            id: id.to_string(),
            realm_id: "realm".to_string(),
            name: name.to_string(),
            client_id: client_id.map(str::to_string),
            description: None,
            composite_ids: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_monotonic_revision_source() {
        let source = MonotonicRevisionSource::new();
        assert_eq!(source.next_revision(), 1);
        assert_eq!(source.next_revision(), 2);
    }

    #[test]
    fn test_store_clones_share_revisions() {
        let store = InMemoryIdentityStore::new();
        let clone = store.clone();
        assert_eq!(store.next_revision().unwrap(), 1);
        assert_eq!(clone.next_revision().unwrap(), 2);
        assert_eq!(store.next_revision().unwrap(), 3);
    }

    #[test]
    fn test_realm_and_client_role_lookup() {
        let store = InMemoryIdentityStore::new();
        store.upsert_role(role("r1", "admin", None)).unwrap();
        store.upsert_role(role("r2", "admin", Some("c1"))).unwrap();

        let realm_role = store.realm_role("realm", "admin").unwrap().unwrap();
        assert_eq!(realm_role.id, "r1");

        let client_role = store.client_role("realm", "c1", "admin").unwrap().unwrap();
        assert_eq!(client_role.id, "r2");

        assert!(store.realm_role("other", "admin").unwrap().is_none());
    }

    #[test]
    fn test_remove_role_strips_references() {
        let store = InMemoryIdentityStore::new();
        let mut parent = role("parent", "parent", None);
        parent.composite_ids.insert("child".to_string());
        store.upsert_role(parent).unwrap();
        store.upsert_role(role("child", "child", None)).unwrap();

        let removed = store.remove_role("child").unwrap();
        assert!(removed.is_some());
        let parent = store.role_by_id("parent").unwrap().unwrap();
        assert!(parent.composite_ids.is_empty());
        assert_eq!(store.role_count(), 1);
    }
}
