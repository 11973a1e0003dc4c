//! Write-behind entity cache service.
//!
//! One `EntityCacheService` per entity type. Reads go through the store and
//! fall back to [`DataAccess::load`] on a miss, with concurrent misses for
//! the same key collapsed into a single load. Mutations are applied to the
//! cached instance right away and persisted later by
//! [`PersistAction`](crate::persist::PersistAction)s that
//! run in submission order on the entity's lane.
//!
//! # Example
//!
//! ```ignore
//! use dbcache::{CacheConfig, EntityCacheService, InMemoryDataAccess};
//! use std::sync::Arc;
//!
//! let repo = Arc::new(InMemoryDataAccess::<Account>::new());
//! let cache = EntityCacheService::<Account>::new(repo, CacheConfig::default())?;
//!
//! if let Some(account) = cache.get(&42).await? {
//!     account.write().await.balance += 10;
//!     cache.submit_updated(&account).await?;
//! }
//!
//! cache.shutdown().await;
//! ```

use crate::actions::{ActionContext, DeleteAction, InsertAction, UpdateAction};
use crate::config::CacheConfig;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::handle::{CachedEntity, EntityHandle, LifecycleStatus};
use crate::index::{IndexExtractor, IndexService, InMemoryIndexService};
use crate::key::{IdRule, NoIdRule};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::persist::{InTimePersistService, PersistService};
use crate::repository::{dump, DataAccess};
use crate::store::{CacheStore, Cached, EvictingStore};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

type Store<T> = dyn CacheStore<<T as Entity>::Id, EntityHandle<T>>;

/// Point-in-time counters for one service.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub entity: &'static str,
    pub waiting_locks: usize,
    pub cached_size: usize,
    pub overflow_size: usize,
    pub index_cached_size: usize,
    pub pending_tasks: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Removes a per-key load lock from the waiting map when the loader is done,
/// unless another loader has already replaced it.
struct LoadPermit<'a, K: Eq + Hash> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    lock: Arc<Mutex<()>>,
}

impl<K: Eq + Hash> Drop for LoadPermit<'_, K> {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.lock));
    }
}

/// Cache service for entity type `T`.
pub struct EntityCacheService<T: Entity> {
    store: Arc<Store<T>>,
    data_access: Arc<dyn DataAccess<T>>,
    index_service: Arc<dyn IndexService<T::Id>>,
    id_rule: Arc<dyn IdRule<T::Id>>,
    persist: Arc<dyn PersistService>,
    metrics: Arc<dyn CacheMetrics>,
    waiting_locks: DashMap<T::Id, Arc<Mutex<()>>>,
    indexes: Arc<[IndexExtractor<T>]>,
    index_enabled: bool,
    dirty_tracking: Option<usize>,
}

impl<T: Entity> EntityCacheService<T> {
    /// Build a service with an [`EvictingStore`], in-memory indexes, no id
    /// rule and an [`InTimePersistService`] on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the configuration is invalid or no
    /// tokio runtime is running.
    pub fn new(data_access: Arc<dyn DataAccess<T>>, config: CacheConfig<T>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::ConfigError(format!(
                "{} cache needs a tokio runtime for persistence: {}",
                T::entity_name(),
                e
            ))
        })?;

        info!(
            "Entity cache for {}: size={}, concurrency={}, indexes={}, dirty_tracking={:?}",
            T::entity_name(),
            config.entity_cache_size,
            config.concurrency_level,
            config.index_enabled(),
            config.dirty_tracking
        );

        Ok(EntityCacheService {
            store: Arc::new(EvictingStore::new(
                config.entity_cache_size,
                config.concurrency_level,
            )),
            data_access,
            index_service: Arc::new(InMemoryIndexService::new()),
            id_rule: Arc::new(NoIdRule),
            persist: Arc::new(InTimePersistService::new(Arc::new(runtime))),
            metrics: Arc::new(NoOpMetrics),
            waiting_locks: DashMap::new(),
            indexes: config.index_table(),
            index_enabled: config.index_enabled(),
            dirty_tracking: config.dirty_tracking,
        })
    }

    pub fn with_store(mut self, store: Arc<Store<T>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_index_service(mut self, index_service: Arc<dyn IndexService<T::Id>>) -> Self {
        self.index_service = index_service;
        self
    }

    pub fn with_id_rule(mut self, id_rule: Arc<dyn IdRule<T::Id>>) -> Self {
        self.id_rule = id_rule;
        self
    }

    pub fn with_persist_service(mut self, persist: Arc<dyn PersistService>) -> Self {
        self.persist = persist;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.metrics = Arc::from(metrics);
        self
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Fetch an entity, loading it on a miss.
    ///
    /// Returns `Ok(None)` when the row does not exist or the cached entity is
    /// marked deleted. Both outcomes are cached.
    ///
    /// # Errors
    ///
    /// Propagates `DataAccess::load` failures.
    pub async fn get(&self, id: &T::Id) -> Result<Option<CachedEntity<T>>> {
        Ok(self.get_handle(id).await?.map(CachedEntity::new))
    }

    /// Fetch several entities; ids that do not resolve are skipped.
    pub async fn get_many(&self, ids: &[T::Id]) -> Result<Vec<CachedEntity<T>>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get(id).await? {
                found.push(entity);
            }
        }
        Ok(found)
    }

    async fn get_handle(&self, id: &T::Id) -> Result<Option<Arc<EntityHandle<T>>>> {
        if let Some(slot) = self.store.get(id) {
            self.metrics.record_hit(T::entity_name());
            return Ok(live(slot));
        }

        let lock = self
            .waiting_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _permit = LoadPermit {
            locks: &self.waiting_locks,
            key: id.clone(),
            lock: Arc::clone(&lock),
        };
        let _guard = lock.lock().await;

        // Another loader may have filled the slot while we waited.
        if let Some(slot) = self.store.get(id) {
            self.metrics.record_hit(T::entity_name());
            return Ok(live(slot));
        }
        self.load(id).await
    }

    async fn load(&self, id: &T::Id) -> Result<Option<Arc<EntityHandle<T>>>> {
        self.metrics.record_miss(T::entity_name());
        let started = Instant::now();
        let loaded = self.data_access.load(id).await?;
        self.metrics.record_load(T::entity_name(), started.elapsed());

        let Some(mut entity) = loaded else {
            debug!("{}:{} not found, caching negative entry", T::entity_name(), id);
            return Ok(live(self.store.put_if_absent(id.clone(), Cached::Negative)));
        };

        entity.after_load();
        let fresh = Arc::new(self.new_handle(id.clone(), entity, LifecycleStatus::Persisted));
        match self
            .store
            .put_if_absent(id.clone(), Cached::Present(Arc::clone(&fresh)))
        {
            Cached::Present(winner) => {
                if !Arc::ptr_eq(&winner, &fresh) {
                    debug!("{}:{} cached concurrently, adopting", T::entity_name(), id);
                }
                if winner.is_deleted() {
                    return Ok(None);
                }
                self.create_indexes(&winner).await;
                Ok(Some(winner))
            }
            Cached::Negative => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Cache a new entity and queue its insert.
    ///
    /// An entity without an id gets one from the id rule. If the id is
    /// already cached, the cached instance is returned; a cached instance
    /// marked deleted is revived with the submitted content.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` when the entity has no id and no id
    /// rule is configured.
    pub async fn submit_new(&self, mut entity: T) -> Result<CachedEntity<T>> {
        let id = match entity.id() {
            Some(id) => id,
            None => {
                let Some(id) = self.id_rule.next_id() else {
                    let msg = format!(
                        "cannot submit new {} without an id: no id rule configured",
                        T::entity_name()
                    );
                    error!("{}", msg);
                    return Err(Error::InvalidArgument(msg));
                };
                entity.set_id(id.clone());
                id
            }
        };

        let handle = match self.store.get(&id).and_then(Cached::into_value) {
            Some(existing) if existing.is_deleted() => {
                warn!(
                    "Reviving deleted {}:{} with new content {}",
                    T::entity_name(),
                    id,
                    dump(&entity)
                );
                *existing.write().await = entity;
                existing.set_status(LifecycleStatus::Persisted);
                existing
            }
            Some(existing) => {
                debug!("{}:{} already cached, keeping cached instance", T::entity_name(), id);
                existing
            }
            None => {
                let fresh = Arc::new(self.new_handle(id.clone(), entity, LifecycleStatus::Persisted));
                self.store.put_if_absent_or_negative(id.clone(), fresh)
            }
        };

        self.create_indexes(&handle).await;
        let edit_version = handle.bump_edit_version();
        let action = InsertAction {
            ctx: self.action_context(&handle),
            edit_version,
        };
        self.persist.handle_persist(handle.lane(), Arc::new(action));
        debug!("» Queued INSERT {}:{} v{}", T::entity_name(), id, edit_version);

        Ok(CachedEntity::new(handle))
    }

    /// Queue an update for an entity obtained from this service.
    ///
    /// Ignored when the id is no longer cached or is marked deleted.
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalState` if the cache now holds a different
    /// instance for the id than the one passed in.
    pub async fn submit_updated(&self, entity: &CachedEntity<T>) -> Result<()> {
        let id = entity.id();
        let Some(handle) = self.get_handle(id).await? else {
            debug!("Update for {}:{} ignored, not cached", T::entity_name(), id);
            return Ok(());
        };

        if !Arc::ptr_eq(&handle, entity.handle()) {
            let msg = format!(
                "cached instance of {}:{} was replaced; update cannot be applied atomically \
                 (submitted: {:?}, cached: {:?})",
                T::entity_name(),
                id,
                entity.handle(),
                handle
            );
            error!("{}", msg);
            return Err(Error::IllegalState(msg));
        }

        let edit_version = handle.bump_edit_version();
        let action = UpdateAction {
            ctx: self.action_context(&handle),
            edit_version,
            db_version: handle.db_version(),
        };
        self.persist.handle_persist(handle.lane(), Arc::new(action));
        debug!("» Queued UPDATE {}:{} v{}", T::entity_name(), id, edit_version);
        Ok(())
    }

    /// Mark an entity deleted and queue its delete.
    ///
    /// `get` stops returning the entity immediately. Absent ids and entities
    /// already marked deleted are ignored.
    pub async fn submit_deleted(&self, id: &T::Id) -> Result<()> {
        let Some(handle) = self.get_handle(id).await? else {
            debug!("Delete for {}:{} ignored, not cached", T::entity_name(), id);
            return Ok(());
        };
        self.delete_handle(handle).await;
        Ok(())
    }

    /// Same as [`submit_deleted`](Self::submit_deleted) with the entity's id.
    pub async fn submit_deleted_entity(&self, entity: &CachedEntity<T>) -> Result<()> {
        self.submit_deleted(entity.id()).await
    }

    async fn delete_handle(&self, handle: Arc<EntityHandle<T>>) {
        if !handle.mark_deleted() {
            return;
        }
        self.remove_indexes(&handle).await;

        let edit_version = handle.bump_edit_version();
        let action = DeleteAction {
            ctx: self.action_context(&handle),
            store: Arc::clone(&self.store),
            edit_version,
            db_version: handle.db_version(),
        };
        self.persist.handle_persist(handle.lane(), Arc::new(action));
        debug!(
            "» Queued DELETE {}:{} v{}",
            T::entity_name(),
            handle.id(),
            edit_version
        );
    }

    // ------------------------------------------------------------------------
    // Index queries
    // ------------------------------------------------------------------------

    /// Ids recorded under `(name, value)`.
    pub fn list_ids_by_index(&self, name: &str, value: &str) -> Vec<T::Id> {
        self.index_service.lookup(name, value)
    }

    /// Entities recorded under `(name, value)`.
    pub async fn list_by_index(&self, name: &str, value: &str) -> Result<Vec<CachedEntity<T>>> {
        let ids = self.list_ids_by_index(name, value);
        self.get_many(&ids).await
    }

    /// One page of the entities recorded under `(name, value)`.
    ///
    /// `page` is 1-based (0 is treated as 1). The page is cut from the id
    /// list first, so ids that no longer resolve make it shorter than `size`.
    pub async fn page_by_index(
        &self,
        name: &str,
        value: &str,
        page: usize,
        size: usize,
    ) -> Result<Vec<CachedEntity<T>>> {
        let ids = self.list_ids_by_index(name, value);
        let start = page.max(1).saturating_sub(1).saturating_mul(size).min(ids.len());
        let end = start.saturating_add(size).min(ids.len());
        self.get_many(&ids[start..end]).await
    }

    // ------------------------------------------------------------------------
    // Lifecycle and introspection
    // ------------------------------------------------------------------------

    /// Ids of cached entities whose latest edits have not been written.
    pub fn unpersisted(&self) -> Vec<T::Id> {
        let mut ids: Vec<T::Id> = self
            .store
            .values()
            .into_iter()
            .filter(|handle| handle.has_unpersisted_changes())
            .map(|handle| handle.id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for queued persistence tasks, then report anything left
    /// unwritten.
    pub async fn shutdown(&self) {
        info!(
            "Shutting down {} cache, draining {} persistence task(s)",
            T::entity_name(),
            self.persist.pending()
        );
        self.persist.await_termination().await;

        let mut unpersisted = 0;
        for handle in self.store.values() {
            if !handle.has_unpersisted_changes() {
                continue;
            }
            unpersisted += 1;
            let body = handle
                .try_read()
                .map(|entity| dump(&*entity))
                .unwrap_or_else(|| "<locked>".to_string());
            warn!(
                "Unpersisted {}:{} edit={} db={} failed={} status={} {}",
                T::entity_name(),
                handle.id(),
                handle.edit_version(),
                handle.db_version(),
                handle.persist_failed(),
                handle.status(),
                body
            );
        }

        if unpersisted == 0 {
            info!("✓ {} cache drained", T::entity_name());
        } else {
            error!(
                "✗ {} cache stopped with {} unpersisted entit(y/ies)",
                T::entity_name(),
                unpersisted
            );
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entity: T::entity_name(),
            waiting_locks: self.waiting_locks.len(),
            cached_size: self.store.len(),
            overflow_size: self.store.overflow_len(),
            index_cached_size: self.index_service.cached_size(),
            pending_tasks: self.persist.pending(),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn new_handle(&self, id: T::Id, entity: T, status: LifecycleStatus) -> EntityHandle<T> {
        EntityHandle::new(
            id,
            entity,
            status,
            Arc::clone(&self.indexes),
            self.dirty_tracking,
        )
    }

    fn action_context(&self, handle: &Arc<EntityHandle<T>>) -> ActionContext<T> {
        ActionContext {
            handle: Arc::clone(handle),
            data_access: Arc::clone(&self.data_access),
            metrics: Arc::clone(&self.metrics),
        }
    }

    async fn create_indexes(&self, handle: &EntityHandle<T>) {
        if !self.index_enabled {
            return;
        }
        let entity = handle.read().await;
        for extractor in handle.indexes() {
            self.index_service
                .create(extractor.name(), &extractor.value(&entity), handle.id());
        }
    }

    async fn remove_indexes(&self, handle: &EntityHandle<T>) {
        if !self.index_enabled {
            return;
        }
        let entity = handle.read().await;
        for extractor in handle.indexes() {
            self.index_service
                .remove(extractor.name(), &extractor.value(&entity), handle.id());
        }
    }
}

/// A cached slot as seen by callers: negative and deleted both read as absent.
fn live<T: Entity>(slot: Cached<EntityHandle<T>>) -> Option<Arc<EntityHandle<T>>> {
    slot.into_value().filter(|handle| !handle.is_deleted())
}
