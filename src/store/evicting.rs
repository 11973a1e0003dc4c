//! Bounded in-memory store (default, thread-safe).
//!
//! Uses a fixed number of `LruCache` shards, each behind its own mutex, to
//! bound lock contention. Eviction is approximate LRU: each shard evicts its
//! own least recently used slot once it is full.
//!
//! Evicted values are not dropped. They move to an overflow map holding only
//! weak references, so a value that something else still holds (a caller, a
//! queued persistence task) is found again on the next `get` instead of
//! being reloaded from the database. Once the last strong reference goes away
//! the overflow entry simply stops resolving.

use super::{CacheStore, Cached};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::collections::HashSet;
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

/// Sharded LRU store with weak overflow.
///
/// # Example
///
/// ```
/// use dbcache::store::{CacheStore, Cached, EvictingStore};
/// use std::sync::Arc;
///
/// let store: EvictingStore<u64, String> = EvictingStore::new(1, 1);
///
/// let kept = Arc::new("kept".to_string());
/// store.put(1, Cached::Present(Arc::clone(&kept)));
/// store.put(2, Cached::Present(Arc::new("other".to_string())));
///
/// // Key 1 was evicted, but `kept` is still referenced here.
/// let slot = store.get(&1).expect("resurrected from overflow");
/// assert!(Arc::ptr_eq(slot.value().unwrap(), &kept));
/// ```
pub struct EvictingStore<K, V> {
    shards: Vec<Mutex<LruCache<K, Cached<V>>>>,
    overflow: DashMap<K, Weak<V>>,
    hasher: RandomState,
    capacity: usize,
}

impl<K, V> EvictingStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Create a store holding at most roughly `capacity` slots spread over
    /// `concurrency_level` shards (rounded up to a power of two).
    pub fn new(capacity: usize, concurrency_level: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = concurrency_level.max(1).next_power_of_two().min(capacity.next_power_of_two());
        let per_shard = capacity.div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();

        EvictingStore {
            shards,
            overflow: DashMap::new(),
            hasher: RandomState::new(),
            capacity,
        }
    }

    /// Configured maximum number of primary slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop overflow entries whose value is gone.
    pub fn purge_overflow(&self) {
        self.overflow.retain(|_, weak| weak.strong_count() > 0);
    }

    fn shard(&self, key: &K) -> &Mutex<LruCache<K, Cached<V>>> {
        let index = (self.hasher.hash_one(key) as usize) & (self.shards.len() - 1);
        &self.shards[index]
    }

    /// Push into a locked shard. An evicted value is moved to overflow before
    /// the caller releases the shard lock, so a held value is always visible
    /// in one of the two maps. Returns true when overflow has outgrown the
    /// capacity and should be purged once the lock is gone.
    fn push_locked(&self, shard: &mut LruCache<K, Cached<V>>, key: K, slot: Cached<V>) -> bool {
        match shard.push(key.clone(), slot) {
            // Same key: a replacement, not an eviction.
            Some((old_key, _)) if old_key == key => false,
            Some((old_key, Cached::Present(value))) => {
                self.overflow.insert(old_key, Arc::downgrade(&value));
                self.overflow.len() > self.capacity
            }
            _ => false,
        }
    }

    /// Take a still-referenced value for `key` out of the overflow map.
    /// Callers hold the key's shard lock.
    fn take_overflow(&self, key: &K) -> Option<Arc<V>> {
        let (_, weak) = self.overflow.remove(key)?;
        weak.upgrade()
    }

    fn purge_if(&self, needed: bool) {
        if needed {
            self.purge_overflow();
        }
    }
}

// Lock order: shard mutex first, then overflow. Nothing touches a shard while
// holding an overflow entry.
impl<K, V> CacheStore<K, V> for EvictingStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    fn get(&self, key: &K) -> Option<Cached<V>> {
        let mut shard = self.shard(key).lock();
        if let Some(slot) = shard.get(key) {
            return Some(slot.clone());
        }

        let slot = Cached::Present(self.take_overflow(key)?);
        let purge = self.push_locked(&mut shard, key.clone(), slot.clone());
        drop(shard);

        debug!("✓ Store GET -> resurrected evicted entry from overflow");
        self.purge_if(purge);
        Some(slot)
    }

    fn put(&self, key: K, value: Cached<V>) {
        let mut shard = self.shard(&key).lock();
        self.overflow.remove(&key);
        let purge = self.push_locked(&mut shard, key, value);
        drop(shard);

        self.purge_if(purge);
    }

    fn put_if_absent(&self, key: K, value: Cached<V>) -> Cached<V> {
        let mut shard = self.shard(&key).lock();
        if let Some(existing) = shard.get(&key) {
            return existing.clone();
        }

        let slot = match self.take_overflow(&key) {
            Some(alive) => Cached::Present(alive),
            None => value,
        };
        let purge = self.push_locked(&mut shard, key, slot.clone());
        drop(shard);

        self.purge_if(purge);
        slot
    }

    fn put_if_absent_or_negative(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut shard = self.shard(&key).lock();
        if let Some(Cached::Present(existing)) = shard.get(&key) {
            return Arc::clone(existing);
        }

        let winner = self.take_overflow(&key).unwrap_or(value);
        let purge = self.push_locked(&mut shard, key, Cached::Present(Arc::clone(&winner)));
        drop(shard);

        self.purge_if(purge);
        winner
    }

    fn evict(&self, key: &K) {
        let mut shard = self.shard(key).lock();
        shard.pop(key);
        self.overflow.remove(key);
    }

    fn evict_value(&self, key: &K, value: &Arc<V>) -> bool {
        let mut shard = self.shard(key).lock();
        let in_primary = matches!(
            shard.peek(key),
            Some(Cached::Present(current)) if Arc::ptr_eq(current, value)
        );
        if in_primary {
            shard.pop(key);
            return true;
        }

        self.overflow
            .remove_if(key, |_, weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(value)))
            .is_some()
    }

    fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.clear();
        }
        self.overflow.clear();
        warn!("⚠ Store CLEAR executed - all cached entries dropped!");
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    fn values(&self) -> Vec<Arc<V>> {
        let mut seen = HashSet::new();
        let mut values: Vec<Arc<V>> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (key, slot) in shard.iter() {
                if let Some(value) = slot.value() {
                    seen.insert(key.clone());
                    values.push(Arc::clone(value));
                }
            }
        }

        // A key can move from a shard to overflow while the shards are being
        // scanned. Report it once.
        for entry in self.overflow.iter() {
            if seen.contains(entry.key()) {
                continue;
            }
            if let Some(value) = entry.value().upgrade() {
                values.push(value);
            }
        }
        values
    }
}
