use crate::{HierarchyId, JointHierarchy, RetargetEntry};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Bounded, insert-only map. Once full, new entries are refused.
#[derive(Debug)]
struct BoundedCache<K, V> {
    capacity: usize,
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K: Eq + std::hash::Hash + Copy, V> BoundedCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the cached value for `key`, or the one already inserted by a racing writer,
    /// or `value` itself when the cache is full.
    fn insert(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }
        if entries.len() < self.capacity {
            entries.insert(key, value.clone());
        }
        value
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Lazily constructed retarget entries keyed by (source, target) hierarchy id.
#[derive(Debug)]
pub struct RetargetCache(BoundedCache<(HierarchyId, HierarchyId), RetargetEntry>);

impl RetargetCache {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedCache::new(capacity))
    }

    pub fn get(&self, src: HierarchyId, dst: HierarchyId) -> Option<Arc<RetargetEntry>> {
        self.0.get(&(src, dst))
    }

    pub fn get_or_construct(
        &self,
        src: HierarchyId,
        dst: HierarchyId,
        construct: impl FnOnce() -> RetargetEntry,
    ) -> Arc<RetargetEntry> {
        if let Some(entry) = self.get(src, dst) {
            return entry;
        }
        // Construction runs outside the lock.
        self.0.insert((src, dst), Arc::new(construct()))
    }

    /// Disables a cached entry. Returns `false` if none is cached.
    pub fn disable(&self, src: HierarchyId, dst: HierarchyId) -> bool {
        match self.get(src, dst) {
            Some(entry) => {
                entry.set_disabled(true);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

/// Intermediate hierarchies rebuilt from clip debug metadata, keyed by hierarchy id.
#[derive(Debug)]
pub struct SkeletonCache(BoundedCache<HierarchyId, JointHierarchy>);

impl SkeletonCache {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedCache::new(capacity))
    }

    pub fn get(&self, id: HierarchyId) -> Option<Arc<JointHierarchy>> {
        self.0.get(&id)
    }

    /// Returns the cached hierarchy for `id` or constructs one. A failed construction is
    /// not cached.
    pub fn get_or_try_construct(
        &self,
        id: HierarchyId,
        construct: impl FnOnce() -> Option<JointHierarchy>,
    ) -> Option<Arc<JointHierarchy>> {
        if let Some(h) = self.get(id) {
            return Some(h);
        }
        let built = construct()?;
        Some(self.0.insert(id, Arc::new(built)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}
