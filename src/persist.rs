//! Persistence tasks and the service that runs them.
//!
//! Every mutation submitted to the cache becomes one [`PersistAction`]: a
//! single-shot write that captured the handle's versions at submission time.
//! A [`PersistService`] schedules the action on the handle's lane, so actions
//! for one entity run in submission order and never overlap.
//!
//! Failures stop at the runner: they are logged with the action's
//! `describe()` dump, passed to `on_error`, and never reach the caller that
//! submitted the mutation.

use crate::error::{Error, Result};
use crate::scheduler::{SerialLane, SerialScheduler, TaskPool};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// A single-shot persistence write.
pub trait PersistAction: Send + Sync {
    /// Perform the write.
    ///
    /// Implementations re-validate against the handle's current state and
    /// return `Ok(())` without writing when they have gone stale.
    fn run(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether the action still applies given the handle's current state.
    fn is_valid(&self) -> bool;

    /// Human-readable dump for audit logs; `None` once the action is stale.
    fn describe(&self) -> Option<String>;

    /// Called by the runner after a failed `run` has been logged.
    fn on_error(&self, _error: &Error) {}
}

/// Trait for persist service implementations.
#[async_trait]
pub trait PersistService: Send + Sync {
    /// Queue `action` behind every action previously queued on `lane`.
    fn handle_persist(&self, lane: &SerialLane, action: Arc<dyn PersistAction>);

    /// Number of queued or running actions.
    fn pending(&self) -> usize;

    /// Wait until every queued action has run.
    async fn await_termination(&self);
}

/// Persist service that writes as soon as a lane worker gets to the action.
#[derive(Clone)]
pub struct InTimePersistService {
    scheduler: SerialScheduler,
}

impl InTimePersistService {
    pub fn new(pool: Arc<dyn TaskPool>) -> Self {
        InTimePersistService {
            scheduler: SerialScheduler::new(pool),
        }
    }

    pub fn scheduler(&self) -> &SerialScheduler {
        &self.scheduler
    }
}

#[async_trait]
impl PersistService for InTimePersistService {
    fn handle_persist(&self, lane: &SerialLane, action: Arc<dyn PersistAction>) {
        let job = async move {
            if let Err(e) = action.run().await {
                let info = action
                    .describe()
                    .unwrap_or_else(|| "<superseded>".to_string());
                error!("✗ Persist task failed: {} [{}]", e, info);
                action.on_error(&e);
            }
        };
        self.scheduler.submit(lane, Box::pin(job));
    }

    fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    async fn await_termination(&self) {
        self.scheduler.await_termination().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorded {
        seq: usize,
        fail: bool,
        log: Arc<Mutex<Vec<usize>>>,
        errors: Arc<AtomicUsize>,
    }

    impl PersistAction for Recorded {
        fn run(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.log.lock().push(self.seq);
                if self.fail {
                    return Err(Error::DataAccess(format!("write {} failed", self.seq)));
                }
                Ok(())
            })
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn describe(&self) -> Option<String> {
            Some(format!("recorded #{}", self.seq))
        }

        fn on_error(&self, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_does_not_stall_following_actions() {
        let service = InTimePersistService::new(Arc::new(tokio::runtime::Handle::current()));
        let lane = SerialLane::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));

        for seq in 0..5 {
            service.handle_persist(
                &lane,
                Arc::new(Recorded {
                    seq,
                    fail: seq == 1,
                    log: Arc::clone(&log),
                    errors: Arc::clone(&errors),
                }),
            );
        }

        service.await_termination().await;
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(service.pending(), 0);
    }
}
