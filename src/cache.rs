//! Identity-preserving resource cache.
//!
//! Remote entities (databases, documents) are addressed by a path relative
//! to their parent, and within one parent at most one live object exists per
//! path. The cache enforces that identity without owning the objects: the
//! identity map holds weak references, so the cache never carries the only
//! reference required for correctness; it only deduplicates construction.
//!
//! Separately from identity, a bounded retention list keeps the most
//! recently registered entries strongly referenced so hot objects survive
//! callers dropping their handles. When the list exceeds its limit, the
//! least-recently-registered non-pinned entries are dropped; a pinned entry
//! (one with an in-flight write) is never evicted.
//!
//! All check-then-act sequences run under one mutex, so concurrent callers
//! can never observe two distinct objects for the same path.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Implemented by anything the cache can hold.
pub trait CacheEntry: Send + Sync + 'static {
    /// A pinned entry is skipped by eviction. Entries report themselves
    /// pinned while a write is in flight.
    fn is_pinned(&self) -> bool {
        false
    }
}

struct Inner<T> {
    /// Path → weak handle. The source of identity.
    identity: HashMap<String, Weak<T>>,
    /// Strong retention in registration-recency order.
    retained: LruCache<String, Arc<T>>,
}

/// Keyed identity map with bounded strong retention.
pub struct ResourceCache<T: CacheEntry> {
    inner: Mutex<Inner<T>>,
    retain_limit: usize,
}

impl<T: CacheEntry> ResourceCache<T> {
    /// Create a cache. `retain_limit` bounds strong retention of non-pinned
    /// entries; 0 means unbounded (never force-evict).
    pub fn new(retain_limit: usize) -> Self {
        ResourceCache {
            inner: Mutex::new(Inner {
                identity: HashMap::new(),
                retained: LruCache::unbounded(),
            }),
            retain_limit,
        }
    }

    /// Look up a live object for `path`.
    ///
    /// A hit refreshes the entry's retention recency.
    pub fn get(&self, path: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let found = inner.identity.get(path).and_then(Weak::upgrade);
        match found {
            Some(entry) => {
                inner.retained.put(path.to_string(), Arc::clone(&entry));
                self.trim(&mut inner);
                Some(entry)
            }
            None => {
                inner.identity.remove(path);
                None
            }
        }
    }

    /// Register an object for `path`.
    ///
    /// Idempotent when called again with the same object. Registering a
    /// *different* object for a live path is a programming error: fatal in
    /// debug builds, logged and ignored in release (the original mapping is
    /// kept, the map is never corrupted).
    pub fn register(&self, path: &str, entry: &Arc<T>) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.identity.get(path).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, entry) {
                let violation = crate::Error::CacheConsistency(format!(
                    "two distinct objects registered for {path:?}"
                ));
                debug_assert!(false, "{violation}");
                tracing::error!(error = %violation, "keeping original mapping");
                return;
            }
        } else {
            inner.identity.insert(path.to_string(), Arc::downgrade(entry));
        }
        inner.retained.put(path.to_string(), Arc::clone(entry));
        self.trim(&mut inner);
    }

    /// Atomic get-or-construct.
    ///
    /// The constructor runs under the cache lock, so two concurrent callers
    /// for an unseen path can never both construct: exactly one object
    /// becomes the identity for `path`.
    pub fn get_or_insert(&self, path: &str, construct: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.identity.get(path).and_then(Weak::upgrade) {
            inner.retained.put(path.to_string(), Arc::clone(&existing));
            return existing;
        }
        let entry = construct();
        inner.identity.insert(path.to_string(), Arc::downgrade(&entry));
        inner.retained.put(path.to_string(), Arc::clone(&entry));
        self.trim(&mut inner);
        entry
    }

    /// Atomic get-or-construct with a fallible constructor.
    ///
    /// Same atomicity as [`get_or_insert`](Self::get_or_insert); a
    /// constructor error leaves the cache untouched.
    pub fn try_get_or_insert<E>(
        &self,
        path: &str,
        construct: impl FnOnce() -> std::result::Result<Arc<T>, E>,
    ) -> std::result::Result<Arc<T>, E> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.identity.get(path).and_then(Weak::upgrade) {
            inner.retained.put(path.to_string(), Arc::clone(&existing));
            return Ok(existing);
        }
        let entry = construct()?;
        inner.identity.insert(path.to_string(), Arc::downgrade(&entry));
        inner.retained.put(path.to_string(), Arc::clone(&entry));
        self.trim(&mut inner);
        Ok(entry)
    }

    /// Unconditionally empty the map and the retention list, busy or not.
    ///
    /// A deliberate cache-bust: callers relying on identity across `clear`
    /// get new instances from then on.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.identity.clear();
        inner.retained.clear();
    }

    /// Number of live identity entries.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.identity.retain(|_, weak| weak.strong_count() > 0);
        inner.identity.len()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn retained_len(&self) -> usize {
        self.inner.lock().retained.len()
    }

    /// Drop least-recently-registered non-pinned entries over the limit, and
    /// prune identity entries whose objects are already gone.
    fn trim(&self, inner: &mut Inner<T>) {
        if self.retain_limit == 0 {
            return;
        }
        let mut pinned = Vec::new();
        while inner.retained.len() > self.retain_limit + pinned.len() {
            match inner.retained.pop_lru() {
                Some((path, entry)) if entry.is_pinned() => pinned.push((path, entry)),
                Some((path, entry)) => {
                    tracing::debug!(path = %path, "evicting cache entry");
                    drop(entry);
                }
                None => break,
            }
        }
        for (path, entry) in pinned {
            inner.retained.put(path, entry);
        }
        inner.identity.retain(|_, weak| weak.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Entry {
        pinned: AtomicBool,
    }

    impl Entry {
        fn new() -> Arc<Self> {
            Arc::new(Entry {
                pinned: AtomicBool::new(false),
            })
        }
    }

    impl CacheEntry for Entry {
        fn is_pinned(&self) -> bool {
            self.pinned.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn get_or_insert_returns_same_object() {
        let cache = ResourceCache::new(0);
        let first = cache.get_or_insert("a", Entry::new);
        let second = cache.get_or_insert("a", Entry::new);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_callers_observe_one_identity() {
        let cache = Arc::new(ResourceCache::new(0));
        let constructed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let constructed = Arc::clone(&constructed);
            handles.push(std::thread::spawn(move || {
                let entry = cache.get_or_insert("shared", || {
                    constructed.fetch_add(1, Ordering::SeqCst);
                    Entry::new()
                });
                Arc::as_ptr(&entry) as usize
            }));
        }
        let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn register_is_idempotent_for_equal_object() {
        let cache = ResourceCache::new(0);
        let entry = Entry::new();
        cache.register("a", &entry);
        cache.register("a", &entry);
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.get("a").unwrap(), &entry));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn register_conflicting_object_keeps_original() {
        let cache = ResourceCache::new(0);
        let original = Entry::new();
        cache.register("a", &original);
        cache.register("a", &Entry::new());
        assert!(Arc::ptr_eq(&cache.get("a").unwrap(), &original));
    }

    #[test]
    fn eviction_drops_least_recently_registered() {
        let cache = ResourceCache::new(2);
        let a = cache.get_or_insert("a", Entry::new);
        drop(a);
        let _b = cache.get_or_insert("b", Entry::new);
        let _c = cache.get_or_insert("c", Entry::new);
        assert_eq!(cache.retained_len(), 2);
        // "a" lost retention and has no external owner left: identity gone.
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn evicted_entry_keeps_identity_through_external_owner() {
        let cache = ResourceCache::new(1);
        let a = cache.get_or_insert("a", Entry::new);
        let _b = cache.get_or_insert("b", Entry::new);
        // Retention moved on, but the external handle keeps "a" live and the
        // identity map keeps deduplicating to it.
        let again = cache.get("a").expect("identity lost while owner held");
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn pinned_entry_survives_retention_pressure() {
        let cache = ResourceCache::new(1);
        let busy = cache.get_or_insert("busy", Entry::new);
        busy.pinned.store(true, Ordering::SeqCst);
        for i in 0..5 {
            let _ = cache.get_or_insert(&format!("doc-{i}"), Entry::new);
        }
        let again = cache.get("busy").expect("pinned entry evicted");
        assert!(Arc::ptr_eq(&busy, &again));
    }

    #[test]
    fn clear_busts_identity() {
        let cache = ResourceCache::new(0);
        let before = cache.get_or_insert("a", Entry::new);
        before.pinned.store(true, Ordering::SeqCst);
        cache.clear();
        let after = cache.get_or_insert("a", Entry::new);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn unbounded_cache_never_evicts() {
        let cache = ResourceCache::new(0);
        for i in 0..100 {
            let _ = cache.get_or_insert(&format!("doc-{i}"), Entry::new);
        }
        assert_eq!(cache.retained_len(), 100);
    }
}
