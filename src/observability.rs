//! Observability hooks for cache and persistence events.
//!
//! Implement [`CacheMetrics`] to feed your monitoring system:
//!
//! ```ignore
//! use dbcache::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _entity: &str) {
//!         // counter!("entity_cache_hits").inc();
//!     }
//!     // ... implement other methods
//! }
//!
//! // let service = EntityCacheService::new(data_access, config)?
//! //     .with_metrics(Box::new(PrometheusMetrics));
//! ```
//!
//! The trait's default methods log through the `log` crate. The service uses
//! [`NoOpMetrics`] unless told otherwise.

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit (including negative hits).
    fn record_hit(&self, entity: &str) {
        debug!("Cache HIT: {}", entity);
    }

    /// Record a cache miss that went to the database.
    fn record_miss(&self, entity: &str) {
        debug!("Cache MISS: {}", entity);
    }

    /// Record a database load and how long it took.
    fn record_load(&self, entity: &str, duration: Duration) {
        debug!("Cache LOAD: {} took {:?}", entity, duration);
    }

    /// Record a task that turned out stale and did nothing.
    fn record_stale(&self, entity: &str) {
        debug!("Persist STALE: {}", entity);
    }

    /// Record a failed persistence write.
    fn record_persist_error(&self, entity: &str, error: &str) {
        warn!("Persist ERROR for {}: {}", entity, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _entity: &str) {}
    fn record_miss(&self, _entity: &str) {}
    fn record_load(&self, _entity: &str, _duration: Duration) {}
    fn record_stale(&self, _entity: &str) {}
    fn record_persist_error(&self, _entity: &str, _error: &str) {}
}

/// Metrics implementation that only logs (the trait defaults).
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}
