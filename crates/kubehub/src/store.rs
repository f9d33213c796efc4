//! Local object cache shared between a watcher and its readers.

use std::sync::{Arc, RwLock};

use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;

/// Read access to a watcher's cached objects.
pub trait Store<K>: Send + Sync {
    fn list(&self) -> Vec<Arc<K>>;
    /// Lookup by `namespace/name`, or `name` for cluster-scoped kinds.
    fn get_by_key(&self, key: &str) -> Option<Arc<K>>;
}

/// Cache key for an object: `namespace/name`, or `name` when cluster-scoped.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Cache keyed by [`object_key`].
pub struct CacheStore<K> {
    items: RwLock<FxHashMap<String, Arc<K>>>,
}

impl<K> Default for CacheStore<K> {
    fn default() -> Self { Self { items: RwLock::new(FxHashMap::default()) } }
}

impl<K: Resource> CacheStore<K> {
    pub fn new() -> Self { Self::default() }

    /// Insert or replace; returns the previous object under the same key.
    pub fn insert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = object_key(obj.as_ref());
        self.items.write().unwrap_or_else(|p| p.into_inner()).insert(key, obj)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.items.write().unwrap_or_else(|p| p.into_inner()).remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }

    pub fn len(&self) -> usize { self.items.read().unwrap_or_else(|p| p.into_inner()).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Resource + Send + Sync> Store<K> for CacheStore<K> {
    fn list(&self) -> Vec<Arc<K>> {
        self.items.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.items.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }
}
