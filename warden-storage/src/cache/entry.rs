//! Revision header shared by every cached snapshot.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

use warden_core::{EntityId, Revision};

use super::traits::Revisioned;

/// Id, revision and creation time of a cached snapshot.
///
/// Only the revision is mutable; it moves forward in place when the cache
/// learns of a newer revision that did not change this snapshot's content.
#[derive(Debug)]
pub struct RevisionedEntry {
    id: EntityId,
    revision: AtomicI64,
    cache_timestamp: i64,
}

impl RevisionedEntry {
    /// Create a header stamped with the current wall-clock time.
    pub fn new(id: impl Into<EntityId>, revision: Revision) -> Self {
        Self::with_timestamp(id, revision, Utc::now().timestamp_millis())
    }

    /// Create a header with an explicit cache timestamp (milliseconds).
    pub fn with_timestamp(id: impl Into<EntityId>, revision: Revision, cache_timestamp: i64) -> Self {
        Self {
            id: id.into(),
            revision: AtomicI64::new(revision),
            cache_timestamp,
        }
    }
}

impl Revisioned for RevisionedEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> Revision {
        self.revision.load(Ordering::Acquire)
    }

    fn set_revision(&self, revision: Revision) {
        self.revision.fetch_max(revision, Ordering::AcqRel);
    }

    fn cache_timestamp(&self) -> i64 {
        self.cache_timestamp
    }
}
