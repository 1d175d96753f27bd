//! Revisioned entry trait and cache statistics.

use warden_core::Revision;

/// A cached snapshot that carries a revision.
///
/// # Implementation Requirements
///
/// - `id()` is stable for the lifetime of the snapshot
/// - `revision()` only changes through `set_revision`, which the cache calls
///   while catching an entry up to a revision that did not alter its content
/// - everything else about the snapshot is immutable once built
/// - two snapshots with the same id and revision are interchangeable
pub trait Revisioned: Send + Sync + 'static {
    /// Identifier of the entity this snapshot was taken from.
    fn id(&self) -> &str;

    /// Revision of the entity at snapshot time.
    fn revision(&self) -> Revision;

    /// Advance the revision in place.
    fn set_revision(&self, revision: Revision);

    /// Wall-clock creation time of the snapshot, in milliseconds.
    fn cache_timestamp(&self) -> i64;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity or TTL.
    pub evictions: u64,
    /// Number of puts discarded because a newer revision was already known.
    pub stale_discards: u64,
    /// Number of entries dropped by invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Sum two stat blocks, e.g. across the per-kind stores of one cache.
    pub fn merge(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            entry_count: self.entry_count + other.entry_count,
            evictions: self.evictions + other.evictions,
            stale_discards: self.stale_discards + other.stale_discards,
            invalidations: self.invalidations + other.invalidations,
        }
    }
}
