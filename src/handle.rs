//! Cached entity handles and their version bookkeeping.
//!
//! An [`EntityHandle`] owns one live entity together with:
//!
//! - an **edit version**, bumped once per submitted mutation,
//! - a **db version**, the last edit version a persistence task claimed,
//! - the [`LifecycleStatus`],
//! - a processing flag gating in-flight writes,
//! - an optional modified-field bitmap and the index extractor table,
//! - the [`SerialLane`] its persistence tasks are ordered on.
//!
//! Callers never see the handle directly. They get a [`CachedEntity`], a
//! cheap clone that shares the handle; holding one keeps the handle reachable
//! from the store's overflow map even after capacity eviction.

use crate::entity::Entity;
use crate::index::IndexExtractor;
use crate::scheduler::SerialLane;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Persistence lifecycle of a cached entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleStatus {
    /// Constructed, not yet known to the database.
    Transient = 0,
    /// Loaded from, or queued for insertion into, the database.
    Persisted = 1,
    /// Marked deleted; `get` no longer returns it.
    Deleted = 2,
}

impl LifecycleStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleStatus::Persisted,
            2 => LifecycleStatus::Deleted,
            _ => LifecycleStatus::Transient,
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStatus::Transient => write!(f, "Transient"),
            LifecycleStatus::Persisted => write!(f, "Persisted"),
            LifecycleStatus::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Bitmap of fields changed since the last successful write.
///
/// Set by the accessor layer, read by persistence tasks.
#[derive(Debug)]
pub struct ModifiedFields {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl ModifiedFields {
    pub fn new(field_count: usize) -> Self {
        let words = (0..field_count.div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect();
        ModifiedFields {
            words,
            len: field_count,
        }
    }

    /// Number of tracked fields.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark a field modified. Out-of-range indexes are ignored.
    pub fn mark(&self, field: usize) {
        if field < self.len {
            self.words[field / 64].fetch_or(1 << (field % 64), Ordering::AcqRel);
        }
    }

    pub fn is_modified(&self, field: usize) -> bool {
        field < self.len && self.words[field / 64].load(Ordering::Acquire) & (1 << (field % 64)) != 0
    }

    /// Indexes of all modified fields, ascending.
    pub fn modified(&self) -> Vec<usize> {
        (0..self.len).filter(|&field| self.is_modified(field)).collect()
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    /// Atomically clear the bitmap, returning what was set.
    pub fn take(&self) -> Vec<usize> {
        let mut fields = Vec::new();
        for (w, word) in self.words.iter().enumerate() {
            let bits = word.swap(0, Ordering::AcqRel);
            for bit in 0..64 {
                if bits & (1 << bit) != 0 {
                    fields.push(w * 64 + bit);
                }
            }
        }
        fields
    }
}

/// Cache-side wrapper around one entity.
pub struct EntityHandle<T: Entity> {
    id: T::Id,
    entity: RwLock<T>,
    edit_version: AtomicU64,
    db_version: AtomicU64,
    status: AtomicU8,
    processing: AtomicBool,
    persist_failed: AtomicBool,
    modified_fields: Option<ModifiedFields>,
    indexes: Arc<[IndexExtractor<T>]>,
    lane: SerialLane,
}

impl<T: Entity> EntityHandle<T> {
    /// Wrap `entity` under key `id`.
    ///
    /// `field_count` enables dirty tracking when `Some`.
    pub fn new(
        id: T::Id,
        entity: T,
        status: LifecycleStatus,
        indexes: Arc<[IndexExtractor<T>]>,
        field_count: Option<usize>,
    ) -> Self {
        EntityHandle {
            id,
            entity: RwLock::new(entity),
            edit_version: AtomicU64::new(0),
            db_version: AtomicU64::new(0),
            status: AtomicU8::new(status as u8),
            processing: AtomicBool::new(false),
            persist_failed: AtomicBool::new(false),
            modified_fields: field_count.map(ModifiedFields::new),
            indexes,
            lane: SerialLane::new(),
        }
    }

    pub fn id(&self) -> &T::Id {
        &self.id
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.entity.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.entity.write().await
    }

    /// Non-blocking read, used by audit dumps.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.entity.try_read().ok()
    }

    /// Atomically increment and return the edit version.
    pub fn bump_edit_version(&self) -> u64 {
        self.edit_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn edit_version(&self) -> u64 {
        self.edit_version.load(Ordering::Acquire)
    }

    pub fn db_version(&self) -> u64 {
        self.db_version.load(Ordering::Acquire)
    }

    /// Set the db version to `new_version` only if it currently equals
    /// `expected_old`. Never moves the version backward.
    pub fn compare_and_advance_db_version(&self, expected_old: u64, new_version: u64) -> bool {
        if new_version < expected_old {
            return false;
        }
        self.db_version
            .compare_exchange(expected_old, new_version, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Raise the db version to at least `version`.
    pub fn raise_db_version(&self, version: u64) {
        self.db_version.fetch_max(version, Ordering::AcqRel);
    }

    pub fn status(&self) -> LifecycleStatus {
        LifecycleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: LifecycleStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.status() == LifecycleStatus::Deleted
    }

    /// Move to `Deleted`; false if the handle was already deleted.
    pub fn mark_deleted(&self) -> bool {
        self.status.swap(LifecycleStatus::Deleted as u8, Ordering::AcqRel)
            != LifecycleStatus::Deleted as u8
    }

    /// Flip the processing flag from `!target` to `target`.
    pub fn swap_processing(&self, target: bool) -> bool {
        self.processing
            .compare_exchange(!target, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub(crate) fn set_persist_failed(&self, failed: bool) {
        self.persist_failed.store(failed, Ordering::Release);
    }

    /// True when the most recent write attempt for this entity failed.
    pub fn persist_failed(&self) -> bool {
        self.persist_failed.load(Ordering::Acquire)
    }

    /// Edits not yet claimed by a persistence task, or a failed last write.
    pub fn has_unpersisted_changes(&self) -> bool {
        self.edit_version() > self.db_version() || self.persist_failed()
    }

    pub fn modified_fields(&self) -> Option<&ModifiedFields> {
        self.modified_fields.as_ref()
    }

    pub fn indexes(&self) -> &[IndexExtractor<T>] {
        &self.indexes
    }

    pub fn lane(&self) -> &SerialLane {
        &self.lane
    }
}

impl<T: Entity> PartialEq for EntityHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: Entity> Eq for EntityHandle<T> {}

impl<T: Entity> Hash for EntityHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        T::entity_name().hash(state);
        self.id.hash(state);
    }
}

impl<T: Entity> fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity", &T::entity_name())
            .field("id", &self.id)
            .field("edit_version", &self.edit_version())
            .field("db_version", &self.db_version())
            .field("status", &self.status())
            .finish()
    }
}

/// The entity instance handed out to callers.
///
/// Clones share one handle. `submit_updated` accepts only the instance the
/// cache currently holds for the id; see [`CachedEntity::same_instance`].
pub struct CachedEntity<T: Entity> {
    handle: Arc<EntityHandle<T>>,
}

impl<T: Entity> CachedEntity<T> {
    pub(crate) fn new(handle: Arc<EntityHandle<T>>) -> Self {
        CachedEntity { handle }
    }

    pub fn id(&self) -> &T::Id {
        self.handle.id()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.handle.read().await
    }

    /// Mutable access. Callers serialize their own field writes; persistence
    /// ordering starts at `submit_updated`.
    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.handle.write().await
    }

    /// Record a field change for dirty tracking. No-op when disabled.
    pub fn mark_modified(&self, field: usize) {
        if let Some(fields) = self.handle.modified_fields() {
            fields.mark(field);
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        self.handle.status()
    }

    /// Identity comparison.
    pub fn same_instance(&self, other: &CachedEntity<T>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    pub fn handle(&self) -> &Arc<EntityHandle<T>> {
        &self.handle
    }
}

impl<T: Entity> Clone for CachedEntity<T> {
    fn clone(&self) -> Self {
        CachedEntity {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: Entity> fmt::Debug for CachedEntity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachedEntity").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Item {
        id: Option<u32>,
        name: String,
    }

    impl Entity for Item {
        type Id = u32;

        fn id(&self) -> Option<Self::Id> {
            self.id
        }

        fn set_id(&mut self, id: Self::Id) {
            self.id = Some(id);
        }

        fn entity_name() -> &'static str {
            "item"
        }
    }

    fn handle(id: u32) -> EntityHandle<Item> {
        EntityHandle::new(
            id,
            Item {
                id: Some(id),
                name: "a".to_string(),
            },
            LifecycleStatus::Persisted,
            Arc::from(Vec::new()),
            None,
        )
    }

    #[test]
    fn test_bump_edit_version() {
        let h = handle(1);
        assert_eq!(h.edit_version(), 0);
        assert_eq!(h.bump_edit_version(), 1);
        assert_eq!(h.bump_edit_version(), 2);
        assert_eq!(h.edit_version(), 2);
    }

    #[test]
    fn test_compare_and_advance() {
        let h = handle(1);
        assert!(h.compare_and_advance_db_version(0, 3));
        assert_eq!(h.db_version(), 3);

        // Stale expectation.
        assert!(!h.compare_and_advance_db_version(0, 4));
        // Backward move refused.
        assert!(!h.compare_and_advance_db_version(3, 2));
        assert_eq!(h.db_version(), 3);
    }

    #[test]
    fn test_raise_db_version_never_lowers() {
        let h = handle(1);
        h.raise_db_version(5);
        h.raise_db_version(2);
        assert_eq!(h.db_version(), 5);
    }

    #[test]
    fn test_swap_processing() {
        let h = handle(1);
        assert!(h.swap_processing(true));
        assert!(!h.swap_processing(true));
        assert!(h.is_processing());
        assert!(h.swap_processing(false));
        assert!(!h.swap_processing(false));
    }

    #[test]
    fn test_status_transitions() {
        let h = handle(1);
        assert_eq!(h.status(), LifecycleStatus::Persisted);
        assert!(h.mark_deleted());
        assert!(!h.mark_deleted());
        assert!(h.is_deleted());
        assert_eq!(h.status().to_string(), "Deleted");
    }

    #[test]
    fn test_equality_by_id() {
        assert_eq!(handle(1), handle(1));
        assert_ne!(handle(1), handle(2));
    }

    #[test]
    fn test_unpersisted_changes() {
        let h = handle(1);
        assert!(!h.has_unpersisted_changes());

        let edit = h.bump_edit_version();
        assert!(h.has_unpersisted_changes());

        assert!(h.compare_and_advance_db_version(0, edit));
        assert!(!h.has_unpersisted_changes());

        h.set_persist_failed(true);
        assert!(h.has_unpersisted_changes());
    }

    #[test]
    fn test_modified_fields() {
        let fields = ModifiedFields::new(70);
        fields.mark(0);
        fields.mark(65);
        fields.mark(200);

        assert!(fields.is_modified(0));
        assert!(fields.is_modified(65));
        assert!(!fields.is_modified(1));
        assert_eq!(fields.modified(), vec![0, 65]);

        fields.clear();
        assert!(fields.modified().is_empty());

        fields.mark(3);
        fields.mark(64);
        assert_eq!(fields.take(), vec![3, 64]);
        assert!(fields.take().is_empty());
    }

    #[tokio::test]
    async fn test_cached_entity_shares_handle() {
        let entity = CachedEntity::new(Arc::new(handle(9)));
        let copy = entity.clone();

        copy.write().await.name = "b".to_string();
        assert_eq!(entity.read().await.name, "b");
        assert!(entity.same_instance(&copy));

        let other = CachedEntity::new(Arc::new(handle(9)));
        assert!(!entity.same_instance(&other));
    }
}
