//! Per-entity-type cache configuration.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::index::IndexExtractor;
use std::sync::Arc;

/// Default maximum number of cached entities per type.
pub const DEFAULT_ENTITY_CACHE_SIZE: usize = 100_000;

/// Default number of store shards.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// Configuration for one `EntityCacheService`.
///
/// # Example
///
/// ```ignore
/// use dbcache::CacheConfig;
///
/// let config = CacheConfig::<Account>::default()
///     .with_entity_cache_size(10_000)
///     .with_concurrency_level(8)
///     .with_index("owner", |a: &Account| a.owner.clone())
///     .with_dirty_tracking(4);
/// ```
pub struct CacheConfig<T: Entity> {
    /// Maximum number of primary cache slots.
    pub entity_cache_size: usize,

    /// Number of store shards (rounded up to a power of two).
    pub concurrency_level: usize,

    /// Maintain secondary indexes on create, load and delete.
    ///
    /// Has no effect without registered extractors.
    pub enable_index: bool,

    /// Field count for the modified-field bitmap, `None` to disable.
    pub dirty_tracking: Option<usize>,

    pub(crate) indexes: Vec<IndexExtractor<T>>,
}

impl<T: Entity> CacheConfig<T> {
    pub fn with_entity_cache_size(mut self, size: usize) -> Self {
        self.entity_cache_size = size;
        self
    }

    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    pub fn with_index_enabled(mut self, enabled: bool) -> Self {
        self.enable_index = enabled;
        self
    }

    /// Register a secondary index extractor.
    pub fn with_index<F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.indexes.push(IndexExtractor::new(name, getter));
        self
    }

    /// Track up to `field_count` modified fields per entity.
    pub fn with_dirty_tracking(mut self, field_count: usize) -> Self {
        self.dirty_tracking = Some(field_count);
        self
    }

    /// Whether index maintenance actually runs.
    pub fn index_enabled(&self) -> bool {
        self.enable_index && !self.indexes.is_empty()
    }

    /// Check the configuration before building a service.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for a zero cache size or concurrency level.
    pub fn validate(&self) -> Result<()> {
        if self.entity_cache_size == 0 {
            return Err(Error::ConfigError(format!(
                "entity_cache_size for {} must be greater than zero",
                T::entity_name()
            )));
        }
        if self.concurrency_level == 0 {
            return Err(Error::ConfigError(format!(
                "concurrency_level for {} must be greater than zero",
                T::entity_name()
            )));
        }
        Ok(())
    }

    pub(crate) fn index_table(&self) -> Arc<[IndexExtractor<T>]> {
        Arc::from(self.indexes.clone())
    }
}

impl<T: Entity> Default for CacheConfig<T> {
    fn default() -> Self {
        CacheConfig {
            entity_cache_size: DEFAULT_ENTITY_CACHE_SIZE,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            enable_index: true,
            dirty_tracking: None,
            indexes: Vec::new(),
        }
    }
}
