//! Data access trait for abstracting the relational store.
//!
//! The `DataAccess` trait decouples the cache from a specific database client.
//! The cache reads through it on a miss and writes through it from persistence
//! tasks; it never generates SQL or knows the schema.
//!
//! # Implementing DataAccess
//!
//! Implement this trait for any storage backend:
//! - SQL databases: SQLx, tokio-postgres, Diesel
//! - In-memory: for testing (provided in this module)
//!
//! # Error Handling
//!
//! Return `Err(Error::DataAccess(..))` for connectivity issues, constraint
//! violations, timeouts and every other storage failure. `load` errors reach
//! the caller of `get`; write errors are logged by the persistence runner.

use crate::entity::Entity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Trait for data access implementations.
#[async_trait]
pub trait DataAccess<T: Entity>: Send + Sync {
    /// Load an entity by primary key.
    ///
    /// # Returns
    /// - `Ok(Some(entity))` - row found
    /// - `Ok(None)` - row not found (not an error)
    /// - `Err(e)` - database error
    async fn load(&self, id: &T::Id) -> Result<Option<T>>;

    /// Insert a new row.
    async fn insert(&self, entity: &T) -> Result<()>;

    /// Update an existing row.
    async fn update(&self, entity: &T) -> Result<()>;

    /// Delete a row.
    async fn delete(&self, entity: &T) -> Result<()>;
}

// ============================================================================
// In-Memory Test Data Access
// ============================================================================

/// Simple in-memory data access for testing.
///
/// Rows are stored as JSON values so that writes are observable as
/// snapshots. Call counters and failure switches let tests verify exactly
/// which writes reached the "database".
pub struct InMemoryDataAccess<T: Entity> {
    rows: parking_lot::Mutex<HashMap<T::Id, serde_json::Value>>,
    seed: parking_lot::Mutex<HashMap<T::Id, T>>,
    loads: AtomicUsize,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    fail_writes: AtomicBool,
    latency: Option<Duration>,
}

impl<T: Entity> InMemoryDataAccess<T> {
    pub fn new() -> Self {
        InMemoryDataAccess {
            rows: parking_lot::Mutex::new(HashMap::new()),
            seed: parking_lot::Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            latency: None,
        }
    }

    /// Add artificial latency to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a loadable row.
    ///
    /// Seeded entities are handed out by `load` (once) and are also recorded
    /// as the current row snapshot.
    pub fn seed(&self, id: T::Id, entity: T) {
        if let Ok(row) = serde_json::to_value(&entity) {
            self.rows.lock().insert(id.clone(), row);
        }
        self.seed.lock().insert(id, entity);
    }

    /// Make every subsequent write fail with `Error::DataAccess`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current row snapshot.
    pub fn row(&self, id: &T::Id) -> Option<serde_json::Value> {
        self.rows.lock().get(id).cloned()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn write_row(&self, entity: &T) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DataAccess("write rejected".to_string()));
        }
        let id = entity
            .id()
            .ok_or_else(|| Error::DataAccess("entity has no id".to_string()))?;
        self.rows.lock().insert(id, serde_json::to_value(entity)?);
        Ok(())
    }
}

impl<T: Entity> Default for InMemoryDataAccess<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> DataAccess<T> for InMemoryDataAccess<T> {
    async fn load(&self, id: &T::Id) -> Result<Option<T>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.seed.lock().remove(id))
    }

    async fn insert(&self, entity: &T) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.write_row(entity)
    }

    async fn update(&self, entity: &T) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.write_row(entity)
    }

    async fn delete(&self, entity: &T) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DataAccess("delete rejected".to_string()));
        }
        if let Some(id) = entity.id() {
            self.rows.lock().remove(&id);
        }
        Ok(())
    }
}

/// Serialize an entity for audit logs.
pub(crate) fn dump<T: Serialize>(entity: &T) -> String {
    serde_json::to_string(entity).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}
