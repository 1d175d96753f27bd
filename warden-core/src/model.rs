//! Live identity-store models.
//!
//! These are the shapes the persistence collaborator hands out. The cache
//! layer snapshots them into revisioned entries; nothing here knows about
//! caching.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{EntityId, Timestamp};

/// Separator between a client id and a role name in qualified role strings
/// (`"my-client.admin"`).
pub const ROLE_SEPARATOR: char = '.';

/// Identity provider config key holding the issuer URL.
pub const ISSUER_CONFIG_KEY: &str = "issuer";

/// A realm: the top-level namespace every other entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmModel {
    pub id: EntityId,
    pub name: String,
    pub enabled: bool,
}

/// A realm role or client role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleModel {
    pub id: EntityId,
    pub realm_id: EntityId,
    pub name: String,
    /// Internal id of the owning client, `None` for realm roles.
    pub client_id: Option<EntityId>,
    pub description: Option<String>,
    /// Ids of the roles this role is composed of.
    pub composite_ids: BTreeSet<EntityId>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl RoleModel {
    /// Returns true if this role belongs to a client.
    pub fn is_client_role(&self) -> bool {
        self.client_id.is_some()
    }

    /// Returns true if this role has composite children.
    pub fn is_composite(&self) -> bool {
        !self.composite_ids.is_empty()
    }
}

/// An OAuth/SAML client registered in a realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientModel {
    /// Internal id.
    pub id: EntityId,
    pub realm_id: EntityId,
    /// Public client identifier (the `client_id` a relying party presents).
    pub client_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    pub attributes: BTreeMap<String, String>,
}

impl ClientModel {
    /// Returns true if every `(name, value)` pair is present on this client.
    pub fn matches_attributes(&self, wanted: &BTreeMap<String, String>) -> bool {
        wanted
            .iter()
            .all(|(name, value)| self.attributes.get(name) == Some(value))
    }
}

/// A group of users with shared role mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupModel {
    pub id: EntityId,
    pub realm_id: EntityId,
    pub name: String,
    pub parent_id: Option<EntityId>,
    pub role_ids: BTreeSet<EntityId>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// A realm user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserModel {
    pub id: EntityId,
    pub realm_id: EntityId,
    pub username: String,
    pub email: Option<String>,
    pub enabled: bool,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub role_ids: BTreeSet<EntityId>,
    pub group_ids: BTreeSet<EntityId>,
    pub created_at: Timestamp,
}

/// A brokered identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProviderModel {
    pub internal_id: EntityId,
    pub realm_id: EntityId,
    pub alias: String,
    pub enabled: bool,
    pub config: BTreeMap<String, String>,
}

impl IdentityProviderModel {
    /// The configured issuer URL, if any.
    pub fn issuer(&self) -> Option<&str> {
        self.config.get(ISSUER_CONFIG_KEY).map(String::as_str)
    }
}

/// An authenticated user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSessionModel {
    pub id: EntityId,
    pub realm_id: EntityId,
    pub user_id: EntityId,
    pub started_at: Timestamp,
    pub last_refresh: Timestamp,
    pub client_ids: BTreeSet<EntityId>,
}
