//! Shared key-value collections
//!
//! Two collections cover every token-indexed store in the core: a concurrent
//! map (topics, users, negative caches) and a bounded LRU map (the `pan.json`
//! cache). Both present the same small surface so higher layers do not care
//! which one backs a given store.

use dashmap::DashMap;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// A concurrent map with cloning reads.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Clone, Debug)]
pub struct SyncMap<K: Eq + Hash, V> {
    inner: Arc<DashMap<K, V>>,
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Insert or replace, returning the previous value if any.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Remove, returning the removed value if any.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Visit every entry until `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for entry in self.inner.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Visit every entry.
    pub fn each(&self, mut f: impl FnMut(&K, &V)) {
        self.range(|k, v| {
            f(k, v);
            true
        });
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Visit every entry, then remove everything (used by close hooks).
    pub fn each_and_clear(&self, mut f: impl FnMut(&K, &V)) {
        self.each(|k, v| f(k, v));
        self.clear();
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Snapshot of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Clone of the value for `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|e| e.value().clone())
    }

    /// Snapshot of the values.
    pub fn values(&self) -> Vec<V> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }
}

/// A bounded LRU map; `get` promotes to most-recently-used and `put` evicts
/// the least-recently-used entry when full.
///
/// A capacity of zero (or less, at call sites using signed config values)
/// means unbounded.
#[derive(Debug)]
pub struct LruMap<K: Eq + Hash, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash,
{
    /// Create a map holding at most `capacity` entries (0 = unbounded).
    pub fn with_capacity(capacity: usize) -> Self {
        let cache = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            inner: Mutex::new(cache),
        }
    }

    /// Whether `key` is present (does not promote).
    pub fn has(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// Insert or replace; may evict the least-recently-used entry.
    pub fn put(&self, key: K, value: V) {
        self.lock().put(key, value);
    }

    /// Remove, returning the removed value if any.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.lock().pop(key)
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, V>> {
        // A poisoned collection lock means a panic mid-put; the cache content
        // is still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Clone of the value for `key`, promoting it to most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }
}
