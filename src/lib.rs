//! # dbcache
//!
//! A write-behind entity cache for relational databases.
//!
//! ## Features
//!
//! - **Read-through:** `get` loads on a miss; concurrent misses for one key share a single load
//! - **Negative caching:** confirmed-absent rows are remembered, not re-queried
//! - **Write-behind:** mutations are applied in memory and persisted asynchronously
//! - **Ordered persistence:** writes for one entity run in submission order, never overlapping,
//!   without a lock or a thread per key
//! - **Stale-write suppression:** superseded updates are skipped, so only the newest edit is written
//! - **Bounded memory:** LRU eviction, with evicted-but-referenced entities still resolvable
//! - **Secondary indexes:** named extractors kept in sync on create, load and delete
//!
//! ## Quick Start
//!
//! ```ignore
//! use dbcache::{CacheConfig, DataAccess, Entity, EntityCacheService};
//! use serde::Serialize;
//! use std::sync::Arc;
//!
//! // 1. Define your entity
//! #[derive(Clone, Serialize)]
//! struct Account {
//!     id: Option<u64>,
//!     owner: String,
//!     balance: i64,
//! }
//!
//! // 2. Implement Entity
//! impl Entity for Account {
//!     type Id = u64;
//!     fn id(&self) -> Option<u64> { self.id }
//!     fn set_id(&mut self, id: u64) { self.id = Some(id); }
//!     fn entity_name() -> &'static str { "account" }
//! }
//!
//! // 3. Implement DataAccess<Account> against your database (see `repository`)
//! let data_access: Arc<dyn DataAccess<Account>> = Arc::new(AccountTable::new(pool));
//!
//! // 4. Build the cache (inside a tokio runtime)
//! let config = CacheConfig::default()
//!     .with_entity_cache_size(50_000)
//!     .with_index("owner", |a: &Account| a.owner.clone());
//! let cache = EntityCacheService::new(data_access, config)?;
//!
//! // 5. Use it
//! if let Some(account) = cache.get(&42).await? {
//!     account.write().await.balance += 100;
//!     cache.submit_updated(&account).await?;
//! }
//! let alices = cache.list_by_index("owner", "alice").await?;
//!
//! // 6. Drain pending writes before exit
//! cache.shutdown().await;
//! ```

#[macro_use]
extern crate log;

mod actions;
pub mod config;
pub mod entity;
pub mod error;
pub mod handle;
pub mod index;
pub mod key;
pub mod observability;
pub mod persist;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod store;

// Re-exports for convenience
pub use config::CacheConfig;
pub use entity::Entity;
pub use error::{Error, Result};
pub use handle::{CachedEntity, EntityHandle, LifecycleStatus};
pub use index::{IndexService, InMemoryIndexService};
pub use key::{IdRule, NoIdRule, SequenceIdRule};
pub use persist::{InTimePersistService, PersistAction, PersistService};
pub use repository::{DataAccess, InMemoryDataAccess};
pub use scheduler::{SerialLane, SerialScheduler, TaskPool};
pub use service::{CacheStats, EntityCacheService};
pub use store::{CacheStore, Cached, EvictingStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
