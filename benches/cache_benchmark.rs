//! Performance benchmarks for dbcache
//!
//! This benchmark suite measures:
//! - EvictingStore operations (get hit, get miss, put with eviction)
//! - SerialScheduler submission on one lane and across many lanes
//! - EntityCacheService reads (hit and cold load) and update submission
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dbcache::{
    CacheConfig, CacheStore, Cached, Entity, EntityCacheService, EvictingStore,
    InMemoryDataAccess, SerialLane, SerialScheduler,
};
use serde::Serialize;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Benchmark Test Fixtures
// ============================================================================

/// Benchmark entity with configurable data size
#[derive(Clone, Serialize)]
struct BenchEntity {
    id: Option<u64>,
    data: Vec<u8>,
}

impl Entity for BenchEntity {
    type Id = u64;

    fn id(&self) -> Option<Self::Id> {
        self.id
    }

    fn set_id(&mut self, id: Self::Id) {
        self.id = Some(id);
    }

    fn entity_name() -> &'static str {
        "bench"
    }
}

impl BenchEntity {
    fn new(id: u64, size: usize) -> Self {
        BenchEntity {
            id: Some(id),
            data: vec![0u8; size],
        }
    }
}

// ============================================================================
// Group 1: Store Benchmarks
// ============================================================================

fn store_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("evicting_store");

    group.bench_function("get_hit", |b| {
        let store: EvictingStore<u64, String> = EvictingStore::new(10_000, 16);
        store.put(7, Cached::Present(Arc::new("value".to_string())));

        b.iter(|| store.get(black_box(&7)));
    });

    group.bench_function("get_miss", |b| {
        let store: EvictingStore<u64, String> = EvictingStore::new(10_000, 16);

        b.iter(|| store.get(black_box(&404)));
    });

    for capacity in [100, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("put_if_absent_churn", capacity),
            capacity,
            |b, &capacity| {
                let store: EvictingStore<u64, String> = EvictingStore::new(capacity, 16);
                let value = Arc::new("value".to_string());
                let mut key = 0u64;

                b.iter(|| {
                    key = key.wrapping_add(1);
                    store.put_if_absent(black_box(key), Cached::Present(Arc::clone(&value)))
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Group 2: Scheduler Benchmarks
// ============================================================================

fn scheduler_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_scheduler");

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    for lanes in [1usize, 64].iter() {
        group
            .throughput(Throughput::Elements(1_000))
            .bench_with_input(BenchmarkId::new("submit_1000", lanes), lanes, |b, &lanes| {
                let scheduler = SerialScheduler::new(Arc::new(rt.handle().clone()));
                let lane_set: Vec<SerialLane> = (0..lanes).map(|_| SerialLane::new()).collect();

                b.to_async(&rt).iter(|| async {
                    for i in 0..1_000 {
                        scheduler.submit(&lane_set[i % lanes], Box::pin(async {}));
                    }
                    scheduler.await_termination().await;
                });
            });
    }

    group.finish();
}

// ============================================================================
// Group 3: Service Benchmarks
// ============================================================================

fn service_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_cache_service");

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    for size in [100, 10_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                let repo = Arc::new(InMemoryDataAccess::new());
                repo.seed(1, BenchEntity::new(1, size));
                let cache = rt
                    .block_on(async {
                        EntityCacheService::<BenchEntity>::new(repo, CacheConfig::default())
                    })
                    .expect("Failed to build service");
                rt.block_on(cache.get(&1)).expect("Failed to load");

                b.to_async(&rt).iter(|| async { cache.get(black_box(&1)).await });
            });
    }

    // Cold load: unique key per iteration forces a miss
    group.bench_function("get_miss_load", |b| {
        let repo = Arc::new(InMemoryDataAccess::<BenchEntity>::new());
        let cache = Arc::new(
            rt.block_on(async {
                EntityCacheService::<BenchEntity>::new(repo.clone(), CacheConfig::default())
            })
            .expect("Failed to build service"),
        );
        let counter = Arc::new(AtomicU64::new(0));

        b.to_async(&rt).iter(|| {
            let cache = Arc::clone(&cache);
            let repo = Arc::clone(&repo);
            let id = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                repo.seed(id, BenchEntity::new(id, 100));
                cache.get(black_box(&id)).await
            }
        });
    });

    group.bench_function("submit_updated", |b| {
        let repo = Arc::new(InMemoryDataAccess::new());
        repo.seed(1, BenchEntity::new(1, 1_000));
        let cache = rt
            .block_on(async {
                EntityCacheService::<BenchEntity>::new(repo, CacheConfig::default())
            })
            .expect("Failed to build service");
        let entity = rt
            .block_on(cache.get(&1))
            .expect("Failed to load")
            .expect("Entity missing");

        b.to_async(&rt)
            .iter(|| async { cache.submit_updated(black_box(&entity)).await });
        rt.block_on(cache.shutdown());
    });

    group.finish();
}

// ============================================================================
// Benchmark Registration
// ============================================================================

criterion_group!(
    benches,
    store_benchmarks,
    scheduler_benchmarks,
    service_benchmarks
);
criterion_main!(benches);
