//! Cache store implementations.

use std::hash::Hash;
use std::sync::Arc;

pub mod evicting;

pub use evicting::EvictingStore;

/// A cached slot.
///
/// `Negative` records a confirmed miss in the backing store so that it is not
/// looked up again; a key that was never looked up has no slot at all.
pub enum Cached<V> {
    Present(Arc<V>),
    Negative,
}

impl<V> Cached<V> {
    /// The cached value, or `None` for a negative entry.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Cached::Present(value) => Some(value),
            Cached::Negative => None,
        }
    }

    pub fn into_value(self) -> Option<Arc<V>> {
        match self {
            Cached::Present(value) => Some(value),
            Cached::Negative => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Cached::Negative)
    }
}

impl<V> Clone for Cached<V> {
    fn clone(&self) -> Self {
        match self {
            Cached::Present(value) => Cached::Present(Arc::clone(value)),
            Cached::Negative => Cached::Negative,
        }
    }
}

impl<V> std::fmt::Debug for Cached<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cached::Present(_) => write!(f, "Present"),
            Cached::Negative => write!(f, "Negative"),
        }
    }
}

/// Trait for cache store implementations.
///
/// **IMPORTANT:** All methods use `&self`; the store is its own lock.
/// Implementations must be safe for concurrent get/insert/evict.
pub trait CacheStore<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Look up a slot.
    ///
    /// # Returns
    /// - `Some(Cached::Present(v))` - value cached
    /// - `Some(Cached::Negative)` - confirmed absent in the backing store
    /// - `None` - never looked up (or evicted)
    fn get(&self, key: &K) -> Option<Cached<V>>;

    /// Insert or replace a slot.
    fn put(&self, key: K, value: Cached<V>);

    /// Insert `value` unless a slot exists; returns whichever slot is cached
    /// afterwards.
    fn put_if_absent(&self, key: K, value: Cached<V>) -> Cached<V>;

    /// Like `put_if_absent`, but a negative slot is replaced by `value`.
    fn put_if_absent_or_negative(&self, key: K, value: Arc<V>) -> Arc<V>;

    /// Remove a key from the store, including any evicted-but-live copy.
    fn evict(&self, key: &K);

    /// Remove `key` only if its slot still holds `value` (compared by
    /// pointer). Returns false when the key now maps to something else.
    fn evict_value(&self, key: &K, value: &Arc<V>) -> bool;

    /// Remove everything.
    fn clear(&self);

    /// Number of slots in the primary store.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of evicted entries still tracked for resurrection.
    fn overflow_len(&self) -> usize {
        0
    }

    /// Snapshot of every live cached value.
    fn values(&self) -> Vec<Arc<V>>;
}
