//! Cache configuration.

use std::time::Duration;

use warden_core::constants::{
    DEFAULT_CACHE_ENTRY_TTL_SECS, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_INVALIDATION_CHANNEL_CAPACITY,
    MAX_CLIENT_LOOKUPS,
};
use warden_core::env;

/// Configuration for the revisioned caches and lookup resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries per revisioned store.
    pub max_entries: usize,
    /// Entries older than this are evicted on the next write or purge.
    pub entry_ttl: Duration,
    /// Upper bound on client lookups while resolving a qualified role string.
    pub max_client_lookups: usize,
    /// Buffer size of the invalidation broadcast channel.
    pub invalidation_channel_capacity: usize,
    /// Identifier of this node in invalidation messages.
    pub node_id: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            entry_ttl: Duration::from_secs(DEFAULT_CACHE_ENTRY_TTL_SECS),
            max_client_lookups: MAX_CLIENT_LOOKUPS,
            invalidation_channel_capacity: DEFAULT_INVALIDATION_CHANNEL_CAPACITY,
            node_id: "local".to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARDEN_CACHE_MAX_ENTRIES`: Max entries per store (default: 10000)
    /// - `WARDEN_CACHE_ENTRY_TTL_SECS`: Entry TTL (default: 3600)
    /// - `WARDEN_CACHE_MAX_CLIENT_LOOKUPS`: Role split budget (default: 25)
    /// - `WARDEN_CACHE_CHANNEL_CAPACITY`: Invalidation channel size (default: 1024)
    /// - `WARDEN_NODE_ID`: Node identifier (default: "local")
    pub fn from_env() -> Self {
        Self {
            max_entries: env::parse_or("WARDEN_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            entry_ttl: Duration::from_secs(env::parse_or(
                "WARDEN_CACHE_ENTRY_TTL_SECS",
                DEFAULT_CACHE_ENTRY_TTL_SECS,
            )),
            max_client_lookups: env::parse_or("WARDEN_CACHE_MAX_CLIENT_LOOKUPS", MAX_CLIENT_LOOKUPS),
            invalidation_channel_capacity: env::parse_or(
                "WARDEN_CACHE_CHANNEL_CAPACITY",
                DEFAULT_INVALIDATION_CHANNEL_CAPACITY,
            ),
            node_id: env::string_or("WARDEN_NODE_ID", "local"),
        }
    }

    /// Small, short-lived caches for development.
    pub fn development() -> Self {
        Self {
            max_entries: 500,
            entry_ttl: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Set the max entries per store.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set the role split budget.
    pub fn with_max_client_lookups(mut self, max: usize) -> Self {
        self.max_client_lookups = max;
        self
    }

    /// Set the node identifier.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}
