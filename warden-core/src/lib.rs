//! Warden Core - Identity Models and Shared Types
//!
//! Pure data structures and helpers. Every other crate depends on this one;
//! it contains no caching or workflow logic.

pub mod constants;
pub mod duration;
pub mod env;
pub mod error;
pub mod identity;
pub mod model;

pub use duration::{parse_delay, parse_duration_millis};
pub use error::{
    CacheError, ConfigError, StorageError, WardenError, WardenResult, WorkflowError,
};
pub use identity::{new_entity_id, EntityId, EntityKind, Revision, Timestamp};
pub use model::{
    ClientModel, GroupModel, IdentityProviderModel, RealmModel, RoleModel, UserModel,
    UserSessionModel, ISSUER_CONFIG_KEY, ROLE_SEPARATOR,
};
