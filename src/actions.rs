//! Insert, update and delete persistence tasks.
//!
//! Each action captures the handle's edit version (and, for update and
//! delete, its db version) at submission time. When the runner reaches it,
//! the action re-checks those snapshots against the handle and quietly does
//! nothing if a newer submission has superseded it.

use crate::entity::Entity;
use crate::error::Result;
use crate::handle::{EntityHandle, LifecycleStatus};
use crate::observability::CacheMetrics;
use crate::persist::PersistAction;
use crate::repository::{dump, DataAccess};
use crate::store::CacheStore;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Claim the right to write `edit_version`.
///
/// Advances the db version from `snapshot` to `edit_version`. If another task
/// moved the db version in between but it is still below `edit_version` and no
/// newer edit exists, the claim is retried from the current value.
pub(crate) fn claim_version<T: Entity>(
    handle: &EntityHandle<T>,
    snapshot: u64,
    edit_version: u64,
) -> bool {
    let mut expected = snapshot;
    loop {
        if handle.compare_and_advance_db_version(expected, edit_version) {
            return true;
        }
        let current = handle.db_version();
        if current >= edit_version || handle.edit_version() != edit_version {
            return false;
        }
        expected = current;
    }
}

fn settle<T: Entity>(
    handle: &EntityHandle<T>,
    metrics: &dyn CacheMetrics,
    result: Result<()>,
) -> Result<()> {
    match &result {
        Ok(()) => handle.set_persist_failed(false),
        Err(e) => {
            handle.set_persist_failed(true);
            metrics.record_persist_error(T::entity_name(), &e.to_string());
        }
    }
    result
}

fn describe_handle<T: Entity>(op: &str, handle: &EntityHandle<T>, edit_version: u64) -> String {
    let body = handle
        .try_read()
        .map(|entity| dump(&*entity))
        .unwrap_or_else(|| "<locked>".to_string());
    let mut out = format!(
        "{} {}:{} v{} {}",
        op,
        T::entity_name(),
        handle.id(),
        edit_version,
        body
    );
    if let Some(fields) = handle.modified_fields() {
        out.push_str(&format!(" modified={:?}", fields.modified()));
    }
    out
}

/// Shared state for every action kind.
pub(crate) struct ActionContext<T: Entity> {
    pub(crate) handle: Arc<EntityHandle<T>>,
    pub(crate) data_access: Arc<dyn DataAccess<T>>,
    pub(crate) metrics: Arc<dyn CacheMetrics>,
}

impl<T: Entity> ActionContext<T> {
    fn stale(&self, op: &str, edit_version: u64) -> Result<()> {
        debug!(
            "Skipping stale {} {}:{} v{} (edit={}, db={})",
            op,
            T::entity_name(),
            self.handle.id(),
            edit_version,
            self.handle.edit_version(),
            self.handle.db_version()
        );
        self.metrics.record_stale(T::entity_name());
        Ok(())
    }

    /// Another write for this handle is still running. Nothing was claimed,
    /// so the edit stays above the db version and is reported unpersisted.
    fn overlapping(&self, op: &str, edit_version: u64) -> Result<()> {
        warn!(
            "{} for {}:{} v{} overlaps a running write, left unpersisted",
            op,
            T::entity_name(),
            self.handle.id(),
            edit_version
        );
        self.handle.set_persist_failed(true);
        self.metrics.record_stale(T::entity_name());
        Ok(())
    }
}

/// Holds the handle's processing flag until dropped.
struct Processing<'a, T: Entity>(&'a EntityHandle<T>);

impl<'a, T: Entity> Processing<'a, T> {
    fn begin(handle: &'a EntityHandle<T>) -> Option<Self> {
        handle.swap_processing(true).then_some(Processing(handle))
    }
}

impl<T: Entity> Drop for Processing<'_, T> {
    fn drop(&mut self) {
        self.0.swap_processing(false);
    }
}

// ============================================================================
// Insert
// ============================================================================

pub(crate) struct InsertAction<T: Entity> {
    pub(crate) ctx: ActionContext<T>,
    pub(crate) edit_version: u64,
}

impl<T: Entity> PersistAction for InsertAction<T> {
    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handle = &self.ctx.handle;
            if !self.is_valid() {
                return self.ctx.stale("INSERT", self.edit_version);
            }

            let mut entity = handle.write().await;
            entity.before_persist();
            let entity = entity.downgrade();

            handle.raise_db_version(self.edit_version);
            let result = self.ctx.data_access.insert(&entity).await;
            drop(entity);

            if result.is_ok() {
                debug!("✓ Inserted {}:{}", T::entity_name(), handle.id());
            }
            settle(handle, &*self.ctx.metrics, result)
        })
    }

    fn is_valid(&self) -> bool {
        !self.ctx.handle.is_deleted()
    }

    fn describe(&self) -> Option<String> {
        self.is_valid()
            .then(|| describe_handle("INSERT", &self.ctx.handle, self.edit_version))
    }
}

// ============================================================================
// Update
// ============================================================================

pub(crate) struct UpdateAction<T: Entity> {
    pub(crate) ctx: ActionContext<T>,
    pub(crate) edit_version: u64,
    pub(crate) db_version: u64,
}

impl<T: Entity> PersistAction for UpdateAction<T> {
    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handle = &self.ctx.handle;
            if self.edit_version < handle.edit_version() {
                return self.ctx.stale("UPDATE", self.edit_version);
            }
            let Some(processing) = Processing::<T>::begin(handle) else {
                return self.ctx.overlapping("UPDATE", self.edit_version);
            };
            if !claim_version(handle, self.db_version, self.edit_version) {
                return self.ctx.stale("UPDATE", self.edit_version);
            }

            let mut entity = handle.write().await;
            entity.before_persist();
            let entity = entity.downgrade();

            if handle.db_version() > self.edit_version {
                return self.ctx.stale("UPDATE", self.edit_version);
            }

            let dirty = handle
                .modified_fields()
                .map(|fields| fields.take())
                .unwrap_or_default();
            let result = self.ctx.data_access.update(&entity).await;
            drop(entity);
            drop(processing);

            match &result {
                Ok(()) => debug!(
                    "✓ Updated {}:{} v{} fields={:?}",
                    T::entity_name(),
                    handle.id(),
                    self.edit_version,
                    dirty
                ),
                Err(_) => {
                    // Keep the fields dirty for the next attempt.
                    if let Some(fields) = handle.modified_fields() {
                        for field in dirty {
                            fields.mark(field);
                        }
                    }
                }
            }
            settle(handle, &*self.ctx.metrics, result)
        })
    }

    fn is_valid(&self) -> bool {
        self.edit_version == self.ctx.handle.edit_version()
    }

    fn describe(&self) -> Option<String> {
        (self.edit_version >= self.ctx.handle.edit_version())
            .then(|| describe_handle("UPDATE", &self.ctx.handle, self.edit_version))
    }
}

// ============================================================================
// Delete
// ============================================================================

pub(crate) struct DeleteAction<T: Entity> {
    pub(crate) ctx: ActionContext<T>,
    pub(crate) store: Arc<dyn CacheStore<T::Id, EntityHandle<T>>>,
    pub(crate) edit_version: u64,
    pub(crate) db_version: u64,
}

impl<T: Entity> PersistAction for DeleteAction<T> {
    fn run(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handle = &self.ctx.handle;
            if handle.status() != LifecycleStatus::Deleted
                || self.edit_version < handle.edit_version()
            {
                return self.ctx.stale("DELETE", self.edit_version);
            }
            let Some(processing) = Processing::<T>::begin(handle) else {
                return self.ctx.overlapping("DELETE", self.edit_version);
            };
            if !claim_version(handle, self.db_version, self.edit_version) {
                return self.ctx.stale("DELETE", self.edit_version);
            }

            let entity = handle.read().await;
            let result = self.ctx.data_access.delete(&entity).await;
            drop(entity);
            drop(processing);

            if result.is_ok() {
                // A revived or reloaded handle under the same id stays cached.
                self.store.evict_value(handle.id(), handle);
                debug!("✓ Deleted {}:{}", T::entity_name(), handle.id());
            }
            settle(handle, &*self.ctx.metrics, result)
        })
    }

    fn is_valid(&self) -> bool {
        self.ctx.handle.is_deleted() && self.edit_version == self.ctx.handle.edit_version()
    }

    fn describe(&self) -> Option<String> {
        self.is_valid()
            .then(|| describe_handle("DELETE", &self.ctx.handle, self.edit_version))
    }
}
