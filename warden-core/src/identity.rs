//! Identity types for Warden entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a persisted entity.
///
/// Identity-store ids are opaque strings (UUIDs in practice, but imported
/// realms may carry arbitrary ids).
pub type EntityId = String;

/// Monotonically assigned version of a persisted entity.
pub type Revision = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 entity id (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7().to_string()
}

/// Entity kind discriminator for the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Realm,
    Role,
    Client,
    Group,
    User,
    IdentityProvider,
    UserSession,
}

impl EntityKind {
    /// Short lowercase name used in log fields and lookup keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Realm => "realm",
            EntityKind::Role => "role",
            EntityKind::Client => "client",
            EntityKind::Group => "group",
            EntityKind::User => "user",
            EntityKind::IdentityProvider => "identity-provider",
            EntityKind::UserSession => "user-session",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
