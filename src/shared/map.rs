//! Concurrent key-value map.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

/// Map shared between tasks. Operations on one key never block operations
/// on keys in other shards. Clones share the same map.
#[derive(Debug)]
pub struct ConcurrentMap<K: Eq + Hash, V> {
    inner: Arc<DashMap<K, V>>,
}

impl<K: Eq + Hash, V> Clone for ConcurrentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::with_capacity(capacity)),
        }
    }

    /// Insert, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Copy of the value for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Mutate the value for `key` in place. `None` if absent.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    /// Value for `key`, inserting `init()` first if absent.
    pub fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        self.inner.entry(key).or_insert_with(init).value().clone()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.inner.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
