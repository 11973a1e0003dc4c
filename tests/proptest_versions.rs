//! Property-based tests for version bookkeeping and the evicting store.
//!
//! # Properties Tested
//!
//! 1. **Monotonic db version**: under any interleaving of edits and task
//!    runs, the db version never moves backward
//! 2. **Last edit wins**: once every task has run, the stored row matches
//!    the newest edit and nothing is left unpersisted
//! 3. **No redundant writes**: never more writes than submitted edits
//! 4. **Live entries resolve**: every value a caller still holds is returned
//!    by the store regardless of capacity evictions

use dbcache::{
    CacheConfig, CacheStore, Cached, Entity, EntityCacheService, EvictingStore,
    InMemoryDataAccess, PersistAction, PersistService, SerialLane,
};
use proptest::prelude::*;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize)]
struct Counter {
    id: Option<u32>,
    value: i64,
}

impl Entity for Counter {
    type Id = u32;

    fn id(&self) -> Option<Self::Id> {
        self.id
    }

    fn set_id(&mut self, id: Self::Id) {
        self.id = Some(id);
    }

    fn entity_name() -> &'static str {
        "counter"
    }
}

/// Persist service that queues actions for the test to run by hand.
#[derive(Default)]
struct ManualPersist {
    queue: parking_lot::Mutex<VecDeque<Arc<dyn PersistAction>>>,
}

impl ManualPersist {
    fn next(&self) -> Option<Arc<dyn PersistAction>> {
        self.queue.lock().pop_front()
    }
}

#[async_trait::async_trait]
impl PersistService for ManualPersist {
    fn handle_persist(&self, _lane: &SerialLane, action: Arc<dyn PersistAction>) {
        self.queue.lock().push_back(action);
    }

    fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    async fn await_termination(&self) {}
}

#[derive(Clone, Debug)]
enum Step {
    Edit(i64),
    Run,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<i64>().prop_map(Step::Edit),
        Just(Step::Run),
    ]
}

// ============================================================================
// Properties 1-3: Version bookkeeping
// ============================================================================

proptest! {
    #[test]
    fn prop_db_version_is_monotonic(steps in prop::collection::vec(arb_step(), 1..40)) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        runtime.block_on(async {
            let repo = Arc::new(InMemoryDataAccess::new());
            repo.seed(1, Counter { id: Some(1), value: 0 });
            let persist = Arc::new(ManualPersist::default());
            let cache = EntityCacheService::<Counter>::new(repo.clone(), CacheConfig::default())
                .expect("service")
                .with_persist_service(persist.clone());

            let entity = cache.get(&1).await.expect("get").expect("present");
            let mut edits = 0;
            let mut last_value = 0;
            let mut db_version = entity.handle().db_version();

            for step in steps {
                match step {
                    Step::Edit(value) => {
                        entity.write().await.value = value;
                        cache.submit_updated(&entity).await.expect("update");
                        edits += 1;
                        last_value = value;
                    }
                    Step::Run => {
                        if let Some(action) = persist.next() {
                            action.run().await.expect("write");
                        }
                    }
                }
                let now = entity.handle().db_version();
                assert!(now >= db_version, "db version moved from {} to {}", db_version, now);
                db_version = now;
            }

            while let Some(action) = persist.next() {
                action.run().await.expect("write");
                let now = entity.handle().db_version();
                assert!(now >= db_version);
                db_version = now;
            }

            assert!(repo.update_count() <= edits);
            assert_eq!(entity.handle().db_version(), entity.handle().edit_version());
            assert!(cache.unpersisted().is_empty());
            if edits > 0 {
                assert_eq!(repo.row(&1).expect("row")["value"], last_value);
            }
        });
    }
}

// ============================================================================
// Property 4: Live entries resolve
// ============================================================================

proptest! {
    #[test]
    fn prop_held_values_survive_eviction(
        capacity in 1usize..16,
        keys in prop::collection::vec(0u16..64, 1..200),
    ) {
        let store: EvictingStore<u16, String> = EvictingStore::new(capacity, 4);
        let mut held = std::collections::HashMap::new();

        for key in keys {
            let value = Arc::new(format!("v{}", key));
            let winner = store.put_if_absent_or_negative(key, Arc::clone(&value));
            held.entry(key).or_insert(winner);
        }

        for (key, value) in &held {
            match store.get(key) {
                Some(Cached::Present(found)) => prop_assert!(Arc::ptr_eq(&found, value)),
                other => prop_assert!(false, "key {} resolved to {:?}", key, other),
            }
        }
    }
}
