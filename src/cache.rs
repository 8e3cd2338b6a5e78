//! Write-through cache: readers see the latest value immediately, writers mark
//! the key dirty, and `take_dirty` hands each changed entry to the flusher once.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use parking_lot::RwLock;

#[derive(Debug)]
struct Inner<K, V> {
    entries: HashMap<K, V>,
    dirty: HashSet<K>,
}

#[derive(Debug)]
pub struct WriteThrough<K, V> {
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> Default for WriteThrough<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WriteThrough<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { entries: HashMap::new(), dirty: HashSet::new() }) }
    }

    /// Seed entries that already match the backing store (not marked dirty).
    pub fn load(&self, items: impl IntoIterator<Item = (K, V)>) {
        let mut inner = self.inner.write();
        inner.entries.extend(items);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        inner.dirty.insert(key.clone());
        inner.entries.insert(key, value);
    }

    /// Mutate an entry in place; returns false when the key is unknown.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let mut inner = self.inner.write();
        let Some(value) = inner.entries.get_mut(key) else {
            return false;
        };
        f(value);
        inner.dirty.insert(key.clone());
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write();
        inner.dirty.remove(key);
        inner.entries.remove(key)
    }

    /// Re-queue a key whose flush failed.
    pub fn mark_dirty(&self, key: K) {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            inner.dirty.insert(key);
        }
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn dirty_len(&self) -> usize {
        self.inner.read().dirty.len()
    }

    /// Drain the dirty set, returning a copy of each changed entry.
    pub fn take_dirty(&self) -> Vec<(K, V)> {
        let mut inner = self.inner.write();
        let dirty: Vec<K> = inner.dirty.drain().collect();
        dirty
            .into_iter()
            .filter_map(|k| inner.entries.get(&k).cloned().map(|v| (k, v)))
            .collect()
    }
}
