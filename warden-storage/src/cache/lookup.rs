//! Alternative lookup cache.
//!
//! Secondary index from a [`LookupKey`] to the canonical identifier of an
//! entity. Entries are hints: every hit is validated against the live model
//! before it is trusted, and a hit that no longer validates is dropped on
//! the spot.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use warden_core::WardenResult;

use super::lookup_key::LookupKey;
use super::traits::CacheStats;

/// Value stored under a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    /// A plain identifier (identity provider alias, client id).
    String(String),
    /// How a qualified role string split into client and role name.
    /// `client_id` is `None` for realm roles.
    RoleQualifier {
        client_id: Option<String>,
        role_name: String,
    },
}

/// Outcome of [`AlternativeLookupCache::lookup_and_validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult<T> {
    /// Cached and still valid against the live model.
    Hit(T),
    /// Nothing cached under the key.
    Miss,
    /// Cached, but the live model no longer agrees. The key has been dropped.
    StaleInvalidated,
}

impl<T> LookupResult<T> {
    /// The validated value of a hit.
    pub fn hit(self) -> Option<T> {
        match self {
            LookupResult::Hit(value) => Some(value),
            LookupResult::Miss | LookupResult::StaleInvalidated => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, LookupResult::Hit(_))
    }
}

/// Cache of lookup keys to [`CachedValue`]s.
#[derive(Debug, Default)]
pub struct AlternativeLookupCache {
    entries: DashMap<LookupKey, CachedValue>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl AlternativeLookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw cached value, unvalidated.
    pub fn get(&self, key: &LookupKey) -> Option<CachedValue> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Read `key` and check the cached value with `validate`.
    ///
    /// `validate` resolves the cached value against the live model and
    /// returns `None` if it no longer holds. It runs without any cache lock
    /// held. A failed validation removes the key, unless another writer
    /// replaced the value in the meantime.
    pub fn lookup_and_validate<T, F>(&self, key: &LookupKey, validate: F) -> WardenResult<LookupResult<T>>
    where
        F: FnOnce(&CachedValue) -> WardenResult<Option<T>>,
    {
        let cached = match self.get(key) {
            Some(value) => value,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(LookupResult::Miss);
            }
        };

        match validate(&cached)? {
            Some(resolved) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(LookupResult::Hit(resolved))
            }
            None => {
                if self.entries.remove_if(key, |_, v| *v == cached).is_some() {
                    self.invalidations.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(key = %key, "Dropped lookup entry that failed validation");
                Ok(LookupResult::StaleInvalidated)
            }
        }
    }

    pub fn put(&self, key: LookupKey, value: CachedValue) {
        self.entries.insert(key, value);
    }

    /// Drop `key`. Returns true if it was cached.
    pub fn invalidate(&self, key: &LookupKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every key of `realm_id`. Returns how many were dropped.
    pub fn invalidate_realm(&self, realm_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.realm_id() != realm_id);
        let dropped = before.saturating_sub(self.entries.len());
        self.invalidations
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lookup_key::LookupCategory;

    fn key(discriminator: &str) -> LookupKey {
        LookupKey::new("realm", LookupCategory::IdentityProviderByIssuer, discriminator)
    }

    #[test]
    fn test_miss_hit_and_stale() {
        let cache = AlternativeLookupCache::new();
        let k = key("https://idp");

        let miss: LookupResult<String> = cache.lookup_and_validate(&k, |_| Ok(None)).unwrap();
        assert_eq!(miss, LookupResult::Miss);

        cache.put(k.clone(), CachedValue::String("corp".to_string()));
        let hit = cache
            .lookup_and_validate(&k, |v| match v {
                CachedValue::String(alias) => Ok(Some(alias.clone())),
                _ => Ok(None),
            })
            .unwrap();
        assert_eq!(hit, LookupResult::Hit("corp".to_string()));

        let stale: LookupResult<String> = cache.lookup_and_validate(&k, |_| Ok(None)).unwrap();
        assert_eq!(stale, LookupResult::StaleInvalidated);
        assert!(cache.get(&k).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.invalidations, 1);
    }

    #[test]
    fn test_validation_error_keeps_entry() {
        let cache = AlternativeLookupCache::new();
        let k = key("https://idp");
        cache.put(k.clone(), CachedValue::String("corp".to_string()));

        let result: WardenResult<LookupResult<String>> = cache.lookup_and_validate(&k, |_| {
            Err(warden_core::StorageError::LockPoisoned.into())
        });
        assert!(result.is_err());
        assert!(cache.get(&k).is_some());
    }

    #[test]
    fn test_invalidate_realm() {
        let cache = AlternativeLookupCache::new();
        cache.put(key("a"), CachedValue::String("x".to_string()));
        cache.put(key("b"), CachedValue::String("y".to_string()));
        cache.put(
            LookupKey::new("other", LookupCategory::Role, "a"),
            CachedValue::RoleQualifier {
                client_id: None,
                role_name: "a".to_string(),
            },
        );

        assert_eq!(cache.invalidate_realm("realm"), 2);
        assert_eq!(cache.len(), 1);
        assert!(!cache.invalidate(&key("a")));
    }

    #[test]
    fn test_cached_value_serde_tagged() {
        let value = CachedValue::RoleQualifier {
            client_id: Some("app".to_string()),
            role_name: "admin".to_string(),
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "role_qualifier");
        let back: CachedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }
}
