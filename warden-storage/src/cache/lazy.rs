//! Memoized, load-once fields of cached snapshots.
//!
//! A [`LazyLoader`] defers an expensive projection of the live model (role
//! composites, group memberships) until the first read, then keeps the
//! result for the rest of the owning snapshot's life. There is no reload and
//! no per-loader invalidation: evicting the owning entry discards the loader
//! with it.

use once_cell::sync::OnceCell;
use std::fmt;

use warden_core::WardenResult;

/// Load-once cell computing `V` from a live model `M`.
///
/// The first completed load wins. Concurrent first reads block on the cell
/// rather than racing, so the loader runs at most once per instance.
pub struct LazyLoader<M, V> {
    loader: fn(&M) -> V,
    fallback: fn() -> V,
    value: OnceCell<V>,
}

impl<M, V> LazyLoader<M, V> {
    /// Create a loader. `fallback` supplies the value when the live model is
    /// gone by the time of the first read.
    pub fn new(loader: fn(&M) -> V, fallback: fn() -> V) -> Self {
        Self {
            loader,
            fallback,
            value: OnceCell::new(),
        }
    }

    /// Return the memoized value, loading it from `supplier` on first use.
    pub fn get<F>(&self, supplier: F) -> &V
    where
        F: FnOnce() -> Option<M>,
    {
        self.value.get_or_init(|| match supplier() {
            Some(model) => (self.loader)(&model),
            None => (self.fallback)(),
        })
    }

    /// Fallible variant of [`get`](Self::get). A supplier error leaves the
    /// loader unloaded so the next read retries.
    pub fn try_get<F>(&self, supplier: F) -> WardenResult<&V>
    where
        F: FnOnce() -> WardenResult<Option<M>>,
    {
        self.value.get_or_try_init(|| {
            Ok(match supplier()? {
                Some(model) => (self.loader)(&model),
                None => (self.fallback)(),
            })
        })
    }

    /// The last materialized value, without loading.
    ///
    /// Invalidation uses this to ask "what did this snapshot point to" without
    /// forcing a load of entries nobody has read yet.
    pub fn materialized(&self) -> Option<&V> {
        self.value.get()
    }

    /// Returns true once a value has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<M, V: fmt::Debug> fmt::Debug for LazyLoader<M, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.get() {
            Some(v) => f.debug_tuple("LazyLoader::Loaded").field(v).finish(),
            None => f.write_str("LazyLoader::NotLoaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use warden_core::{StorageError, WardenError};

    fn length_loader() -> LazyLoader<String, usize> {
        LazyLoader::new(|s: &String| s.len(), || 0)
    }

    #[test]
    fn test_second_supplier_never_invoked() {
        let loader = length_loader();
        assert_eq!(*loader.get(|| Some("abc".to_string())), 3);

        let called = AtomicUsize::new(0);
        let second = loader.get(|| {
            called.fetch_add(1, Ordering::SeqCst);
            Some("a much longer live model".to_string())
        });
        assert_eq!(*second, 3);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fallback_when_model_missing() {
        let loader = length_loader();
        assert_eq!(*loader.get(|| None), 0);
        assert!(loader.is_loaded());
    }

    #[test]
    fn test_try_get_error_leaves_unloaded() {
        let loader = length_loader();
        let result = loader.try_get(|| Err(WardenError::from(StorageError::LockPoisoned)));
        assert!(result.is_err());
        assert!(!loader.is_loaded());
        assert!(loader.materialized().is_none());

        assert_eq!(*loader.try_get(|| Ok(Some("ab".to_string()))).unwrap(), 2);
        assert_eq!(loader.materialized(), Some(&2));
    }

    #[test]
    fn test_concurrent_first_reads_load_once() {
        let loader = Arc::new(length_loader());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let loader = Arc::clone(&loader);
                let loads = Arc::clone(&loads);
                std::thread::spawn(move || {
                    *loader.get(|| {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Some("x".repeat(i + 1))
                    })
                })
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
