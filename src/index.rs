//! Secondary index service.
//!
//! An index maps `(index name, value)` to the set of primary keys carrying
//! that value. The cache keeps indexes in sync when entities are created,
//! loaded or deleted; value extraction is done with the [`IndexExtractor`]
//! table registered in `CacheConfig`.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

type GetterFn<T> = dyn Fn(&T) -> String + Send + Sync;

/// Named value getter for one secondary index.
pub struct IndexExtractor<T> {
    name: String,
    getter: Arc<GetterFn<T>>,
}

impl<T> IndexExtractor<T> {
    pub fn new<F>(name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        IndexExtractor {
            name: name.into(),
            getter: Arc::new(getter),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extract the index value from an entity.
    pub fn value(&self, entity: &T) -> String {
        (self.getter)(entity)
    }
}

impl<T> Clone for IndexExtractor<T> {
    fn clone(&self) -> Self {
        IndexExtractor {
            name: self.name.clone(),
            getter: Arc::clone(&self.getter),
        }
    }
}

impl<T> fmt::Debug for IndexExtractor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexExtractor")
            .field("name", &self.name)
            .finish()
    }
}

/// Trait for secondary index implementations.
///
/// Implementations: in-memory (provided), database-backed index tables, etc.
pub trait IndexService<Id>: Send + Sync {
    /// Add `id` under `(name, value)`.
    fn create(&self, name: &str, value: &str, id: &Id);

    /// Remove `id` from `(name, value)`.
    fn remove(&self, name: &str, value: &str, id: &Id);

    /// All ids under `(name, value)`, in index order.
    fn lookup(&self, name: &str, value: &str) -> Vec<Id>;

    /// Number of cached index entries, for stats.
    fn cached_size(&self) -> usize;
}

/// Index service keeping everything in process memory.
pub struct InMemoryIndexService<Id> {
    entries: DashMap<(String, String), BTreeSet<Id>>,
}

impl<Id: Ord + Clone + Send + Sync> InMemoryIndexService<Id> {
    pub fn new() -> Self {
        InMemoryIndexService {
            entries: DashMap::new(),
        }
    }
}

impl<Id: Ord + Clone + Send + Sync> Default for InMemoryIndexService<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: Ord + Clone + Send + Sync> IndexService<Id> for InMemoryIndexService<Id> {
    fn create(&self, name: &str, value: &str, id: &Id) {
        self.entries
            .entry((name.to_string(), value.to_string()))
            .or_default()
            .insert(id.clone());
    }

    fn remove(&self, name: &str, value: &str, id: &Id) {
        let key = (name.to_string(), value.to_string());
        if let Some(mut ids) = self.entries.get_mut(&key) {
            ids.remove(id);
        }
        self.entries.remove_if(&key, |_, ids| ids.is_empty());
    }

    fn lookup(&self, name: &str, value: &str) -> Vec<Id> {
        self.entries
            .get(&(name.to_string(), value.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn cached_size(&self) -> usize {
        self.entries.len()
    }
}
