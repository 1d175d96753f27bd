//! Cached snapshots of identity-store entities.
//!
//! Each snapshot copies the scalar fields of its live model at load time.
//! Sub-collections that are expensive to resolve (composite roles, role
//! mappings, group memberships, subgroups) are held in [`LazyLoader`]s and
//! read through the [`IdentityStore`] on first access only.

use std::collections::{BTreeMap, BTreeSet};

use warden_core::{
    ClientModel, EntityId, GroupModel, IdentityProviderModel, Revision, RoleModel, Timestamp,
    UserModel, UserSessionModel, WardenResult,
};

use super::entry::RevisionedEntry;
use super::lazy::LazyLoader;
use super::traits::Revisioned;
use crate::IdentityStore;

/// Implements [`Revisioned`] by delegating to the `entry` field.
macro_rules! impl_revisioned {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Revisioned for $ty {
                fn id(&self) -> &str {
                    self.entry.id()
                }

                fn revision(&self) -> Revision {
                    self.entry.revision()
                }

                fn set_revision(&self, revision: Revision) {
                    self.entry.set_revision(revision)
                }

                fn cache_timestamp(&self) -> i64 {
                    self.entry.cache_timestamp()
                }
            }
        )+
    };
}

impl_revisioned!(
    CachedRole,
    CachedClient,
    CachedGroup,
    CachedUser,
    CachedIdentityProvider,
    CachedUserSession,
);

// ============================================================================
// ROLE
// ============================================================================

/// Snapshot of a realm or client role.
#[derive(Debug)]
pub struct CachedRole {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub name: String,
    pub client_id: Option<EntityId>,
    pub description: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
    composites: LazyLoader<RoleModel, BTreeSet<EntityId>>,
}

impl CachedRole {
    pub fn from_model(model: &RoleModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.id.clone(), revision),
            realm_id: model.realm_id.clone(),
            name: model.name.clone(),
            client_id: model.client_id.clone(),
            description: model.description.clone(),
            attributes: model.attributes.clone(),
            composites: LazyLoader::new(|m: &RoleModel| m.composite_ids.clone(), BTreeSet::new),
        }
    }

    /// Returns true if this is a client role.
    pub fn is_client_role(&self) -> bool {
        self.client_id.is_some()
    }

    /// Ids of the direct composite children, loaded on first call.
    pub fn composites(&self, store: &dyn IdentityStore) -> WardenResult<&BTreeSet<EntityId>> {
        self.composites.try_get(|| store.role_by_id(self.id()))
    }

    /// Composite children as last loaded, or `None` if never loaded.
    pub fn materialized_composites(&self) -> Option<&BTreeSet<EntityId>> {
        self.composites.materialized()
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Snapshot of a client.
#[derive(Debug)]
pub struct CachedClient {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub client_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub attributes: BTreeMap<String, String>,
}

impl CachedClient {
    pub fn from_model(model: &ClientModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.id.clone(), revision),
            realm_id: model.realm_id.clone(),
            client_id: model.client_id.clone(),
            name: model.name.clone(),
            enabled: model.enabled,
            attributes: model.attributes.clone(),
        }
    }
}

// ============================================================================
// GROUP
// ============================================================================

/// Snapshot of a group.
#[derive(Debug)]
pub struct CachedGroup {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub name: String,
    pub parent_id: Option<EntityId>,
    pub attributes: BTreeMap<String, Vec<String>>,
    role_mappings: LazyLoader<GroupModel, BTreeSet<EntityId>>,
    subgroups: LazyLoader<Vec<GroupModel>, Vec<EntityId>>,
}

impl CachedGroup {
    pub fn from_model(model: &GroupModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.id.clone(), revision),
            realm_id: model.realm_id.clone(),
            name: model.name.clone(),
            parent_id: model.parent_id.clone(),
            attributes: model.attributes.clone(),
            role_mappings: LazyLoader::new(|m: &GroupModel| m.role_ids.clone(), BTreeSet::new),
            subgroups: LazyLoader::new(
                |groups: &Vec<GroupModel>| groups.iter().map(|g| g.id.clone()).collect(),
                Vec::new,
            ),
        }
    }

    /// Ids of the roles mapped to this group.
    pub fn role_mappings(&self, store: &dyn IdentityStore) -> WardenResult<&BTreeSet<EntityId>> {
        self.role_mappings.try_get(|| store.group_by_id(self.id()))
    }

    pub fn materialized_role_mappings(&self) -> Option<&BTreeSet<EntityId>> {
        self.role_mappings.materialized()
    }

    /// Ids of the direct subgroups.
    pub fn subgroups(&self, store: &dyn IdentityStore) -> WardenResult<&[EntityId]> {
        self.subgroups
            .try_get(|| store.subgroups(self.id()).map(Some))
            .map(Vec::as_slice)
    }
}

// ============================================================================
// USER
// ============================================================================

/// Snapshot of a user.
#[derive(Debug)]
pub struct CachedUser {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub username: String,
    pub email: Option<String>,
    pub enabled: bool,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub created_at: Timestamp,
    role_mappings: LazyLoader<UserModel, BTreeSet<EntityId>>,
    group_ids: LazyLoader<UserModel, BTreeSet<EntityId>>,
}

impl CachedUser {
    pub fn from_model(model: &UserModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.id.clone(), revision),
            realm_id: model.realm_id.clone(),
            username: model.username.clone(),
            email: model.email.clone(),
            enabled: model.enabled,
            attributes: model.attributes.clone(),
            created_at: model.created_at,
            role_mappings: LazyLoader::new(|m: &UserModel| m.role_ids.clone(), BTreeSet::new),
            group_ids: LazyLoader::new(|m: &UserModel| m.group_ids.clone(), BTreeSet::new),
        }
    }

    /// Ids of the roles mapped directly to this user.
    pub fn role_mappings(&self, store: &dyn IdentityStore) -> WardenResult<&BTreeSet<EntityId>> {
        self.role_mappings.try_get(|| store.user_by_id(self.id()))
    }

    pub fn materialized_role_mappings(&self) -> Option<&BTreeSet<EntityId>> {
        self.role_mappings.materialized()
    }

    /// Ids of the groups this user belongs to.
    pub fn group_ids(&self, store: &dyn IdentityStore) -> WardenResult<&BTreeSet<EntityId>> {
        self.group_ids.try_get(|| store.user_by_id(self.id()))
    }

    pub fn materialized_group_ids(&self) -> Option<&BTreeSet<EntityId>> {
        self.group_ids.materialized()
    }
}

// ============================================================================
// IDENTITY PROVIDER
// ============================================================================

/// Snapshot of an identity provider. Keyed by its internal id.
#[derive(Debug)]
pub struct CachedIdentityProvider {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub alias: String,
    pub enabled: bool,
    pub config: BTreeMap<String, String>,
}

impl CachedIdentityProvider {
    pub fn from_model(model: &IdentityProviderModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.internal_id.clone(), revision),
            realm_id: model.realm_id.clone(),
            alias: model.alias.clone(),
            enabled: model.enabled,
            config: model.config.clone(),
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        self.config
            .get(warden_core::ISSUER_CONFIG_KEY)
            .map(String::as_str)
    }
}

// ============================================================================
// USER SESSION
// ============================================================================

#[derive(Debug)]
pub struct CachedUserSession {
    entry: RevisionedEntry,
    pub realm_id: EntityId,
    pub user_id: EntityId,
    pub started_at: Timestamp,
    pub last_refresh: Timestamp,
    pub client_ids: BTreeSet<EntityId>,
}

impl CachedUserSession {
    pub fn from_model(model: &UserSessionModel, revision: Revision) -> Self {
        Self {
            entry: RevisionedEntry::new(model.id.clone(), revision),
            realm_id: model.realm_id.clone(),
            user_id: model.user_id.clone(),
            started_at: model.started_at,
            last_refresh: model.last_refresh,
            client_ids: model.client_ids.clone(),
        }
    }
}
