//! Revision-based cache layer for the identity store.
//!
//! Every cached snapshot carries the revision of the entity it was taken
//! from. The cache never checks freshness on read; instead, writers announce
//! new revisions and every node evicts copies older than the announced one.
//!
//! # Layers
//!
//! - [`RevisionedEntry`] and [`LazyLoader`]: the snapshot header and its
//!   load-once sub-fields
//! - [`RevisionedCacheStore`]: id to snapshot, compare-and-swap by revision
//! - [`AlternativeLookupCache`] and the resolvers in [`resolve`]: validated
//!   hints from issuer URLs, attribute sets and role strings to entities
//! - [`IdentityCache`]: read-through facade with mutation hooks that publish
//!   [`InvalidationMessage`]s to the other nodes
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(IdentityCache::new(store, CacheConfig::from_env()).with_bus(bus.clone()));
//! tokio::spawn(invalidation_listener_task(cache.clone(), bus.subscribe(), shutdown_rx));
//!
//! let role = cache.role(&role_id)?;
//! // after changing the live model:
//! cache.on_role_updated(&role_id)?;
//! ```

pub mod config;
pub mod entities;
pub mod entry;
pub mod identity;
pub mod invalidation;
pub mod lazy;
pub mod lookup;
pub mod lookup_key;
pub mod resolve;
pub mod store;
pub mod traits;

pub use config::CacheConfig;
pub use entities::{
    CachedClient, CachedGroup, CachedIdentityProvider, CachedRole, CachedUser, CachedUserSession,
};
pub use entry::RevisionedEntry;
pub use identity::IdentityCache;
pub use invalidation::{
    invalidation_listener_task, BroadcastInvalidationBus, InvalidationAction, InvalidationBus,
    InvalidationListenerSnapshot, InvalidationMessage,
};
pub use lazy::LazyLoader;
pub use lookup::{AlternativeLookupCache, CachedValue, LookupResult};
pub use lookup_key::{LookupCategory, LookupKey};
pub use resolve::{
    lookup_client_from_attributes, lookup_identity_provider_from_issuer, lookup_role_from_string,
};
pub use store::{PutOutcome, RevisionedCacheStore};
pub use traits::{CacheStats, Revisioned};
