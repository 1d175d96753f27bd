//! Revisioned cache store.
//!
//! Maps entity id to the cached snapshot of that entity and decides whether a
//! snapshot is still current. Freshness is never checked on read: the store
//! trusts whatever it holds until an invalidation says otherwise.
//!
//! # Concurrency
//!
//! Entries live in a sharded [`DashMap`], so operations on distinct ids do
//! not contend. Every mutation of one id runs under that id's shard lock in
//! `entries` and only then touches `revisions`; the two maps are always
//! locked in that order.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use warden_core::{EntityId, Revision};

use super::config::CacheConfig;
use super::traits::{CacheStats, Revisioned};

/// Result of a [`RevisionedCacheStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No entry was cached for the id.
    Stored,
    /// An older entry was replaced.
    Replaced,
    /// The incoming revision was not newer than what is already known.
    StaleDiscarded,
}

impl PutOutcome {
    /// Returns true if the incoming entry is now the cached one.
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored | PutOutcome::Replaced)
    }
}

/// Cache of revisioned snapshots keyed by entity id.
///
/// Besides the entries themselves, the store remembers the latest revision
/// it has heard of for every id, including ids that are not cached. A
/// snapshot built before an invalidation arrived is therefore rejected even
/// if the invalidation found nothing to evict.
pub struct RevisionedCacheStore<E: Revisioned> {
    name: &'static str,
    entries: DashMap<EntityId, Arc<E>>,
    revisions: DashMap<EntityId, Revision>,
    max_entries: usize,
    entry_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stale_discards: AtomicU64,
    invalidations: AtomicU64,
}

impl<E: Revisioned> RevisionedCacheStore<E> {
    /// Create a store. `name` labels its log lines.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            revisions: DashMap::new(),
            max_entries: config.max_entries,
            entry_ttl: config.entry_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Name of this store.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Return the locally cached entry, if any.
    pub fn get(&self, id: &str) -> Option<Arc<E>> {
        match self.entries.get(id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Latest revision known for `id`, or 0 if none was ever seen.
    ///
    /// Read this before loading from the live model and stamp it on the new
    /// snapshot, so that an invalidation landing during the load makes the
    /// resulting `put` a stale discard.
    pub fn current_revision(&self, id: &str) -> Revision {
        self.revisions.get(id).map(|r| *r.value()).unwrap_or(0)
    }

    /// Insert or replace the entry for `entry.id()`.
    ///
    /// Succeeds only if the incoming revision is strictly greater than the
    /// cached entry's and not lower than the latest known revision.
    pub fn put(&self, entry: Arc<E>) -> PutOutcome {
        let id = entry.id().to_string();
        let incoming = entry.revision();

        let outcome = match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get().revision();
                if incoming <= stored || incoming < self.current_revision(&id) {
                    PutOutcome::StaleDiscarded
                } else {
                    occupied.insert(entry);
                    self.raise_known_revision(&id, incoming);
                    PutOutcome::Replaced
                }
            }
            Entry::Vacant(vacant) => {
                if incoming < self.current_revision(&id) {
                    PutOutcome::StaleDiscarded
                } else {
                    vacant.insert(entry);
                    self.raise_known_revision(&id, incoming);
                    PutOutcome::Stored
                }
            }
        };

        match outcome {
            PutOutcome::StaleDiscarded => {
                self.stale_discards.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(cache = self.name, id = %id, revision = incoming, "Discarded stale put");
            }
            PutOutcome::Stored => self.enforce_limits(),
            PutOutcome::Replaced => {}
        }
        outcome
    }

    /// Record that `id` is now at `revision` and evict a cached copy older
    /// than that. Returns true if an entry was evicted.
    ///
    /// Revisions only move forward: an invalidation older than what is
    /// already known changes nothing.
    pub fn invalidate(&self, id: &str, revision: Revision) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(occupied) => {
                self.raise_known_revision(id, revision);
                if occupied.get().revision() < revision {
                    occupied.remove();
                    self.invalidations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(cache = self.name, id = %id, revision, "Evicted stale entry");
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                self.raise_known_revision(id, revision);
                false
            }
        }
    }

    /// Move a cached entry's revision forward in place, keeping its content.
    ///
    /// Used when the entity changed in a way its snapshot does not reflect.
    /// Returns true if a cached entry was advanced.
    pub fn advance(&self, id: &str, revision: Revision) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(occupied) => {
                self.raise_known_revision(id, revision);
                let entry = occupied.get();
                if entry.revision() < revision {
                    entry.set_revision(revision);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                self.raise_known_revision(id, revision);
                false
            }
        }
    }

    /// Invalidate every cached entry matching `predicate` at `revision`.
    ///
    /// Returns the ids that were evicted.
    pub fn invalidate_where<F>(&self, revision: Revision, predicate: F) -> Vec<EntityId>
    where
        F: Fn(&E) -> bool,
    {
        let candidates: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|e| predicate(e.value().as_ref()))
            .map(|e| e.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| self.invalidate(id, revision))
            .collect()
    }

    /// Drop the entry for `id` without recording a revision.
    pub fn remove(&self, id: &str) -> Option<Arc<E>> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    /// Evict entries older than the configured TTL. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        if self.entry_ttl.is_zero() {
            return 0;
        }
        let cutoff = Utc::now().timestamp_millis() - self.entry_ttl.as_millis() as i64;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.cache_timestamp() > cutoff);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
            tracing::debug!(cache = self.name, purged, "Purged expired entries");
        }
        purged
    }

    /// Drop every cached entry. Known revisions are kept.
    pub fn clear(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        self.invalidations
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn raise_known_revision(&self, id: &str, revision: Revision) {
        self.revisions
            .entry(id.to_string())
            .and_modify(|known| *known = (*known).max(revision))
            .or_insert(revision);
    }

    // A max_entries of 0 disables the capacity bound.
    fn enforce_limits(&self) {
        self.purge_expired();
        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().cache_timestamp())
                .map(|e| e.key().clone());
            match oldest {
                Some(id) => {
                    if self.entries.remove(&id).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(cache = self.name, id = %id, "Evicted for capacity");
                    }
                }
                None => break,
            }
        }
    }
}

impl<E: Revisioned> std::fmt::Debug for RevisionedCacheStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionedCacheStore")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
