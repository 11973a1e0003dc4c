//! Lock-free per-key serial execution on a shared worker pool.
//!
//! Every key owns a [`SerialLane`]: an atomically swapped pointer to the tail
//! of its job chain. Jobs submitted to the same lane run one at a time, in
//! submission order, exactly once each. Jobs on different lanes run in
//! parallel on the pool.
//!
//! # Chain protocol
//!
//! A node's `next` link has three states:
//!
//! ```text
//! unset    -> no successor yet, the node may still be running
//! node     -> successor appended, the running worker will continue with it
//! DRAINED  -> the node finished with no successor; the chain is idle
//! ```
//!
//! Submitting reads the lane tail. An empty or drained tail is replaced by the
//! new node, which is then dispatched to the pool. A live tail gets the node
//! appended to its `next` link and nothing is dispatched: the worker that runs
//! the tail picks the node up when it gets there. Lost races re-read the tail
//! and retry.
//!
//! One dispatched worker therefore runs an arbitrarily long run of queued
//! jobs for its lane before it returns the thread to the pool.

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// A unit of work scheduled on a lane.
pub type Job = BoxFuture<'static, ()>;

/// Shared worker pool that runs dispatched lane workers.
pub trait TaskPool: Send + Sync {
    /// Run the given future to completion somewhere in the pool.
    fn spawn(&self, job: Job);
}

impl TaskPool for tokio::runtime::Handle {
    fn spawn(&self, job: Job) {
        // Detached: completion is tracked by the scheduler's in-flight counter.
        drop(tokio::runtime::Handle::spawn(self, job));
    }
}

struct Node {
    job: Mutex<Option<Job>>,
    next: ArcSwapOption<Node>,
}

impl Node {
    fn new(job: Option<Job>) -> Self {
        Node {
            job: Mutex::new(job),
            next: ArcSwapOption::empty(),
        }
    }

    fn take_job(&self) -> Option<Job> {
        self.job.lock().take()
    }

    fn is_drained(&self) -> bool {
        let next = self.next.load();
        matches!(&*next, Some(node) if Arc::ptr_eq(node, drained()))
    }

    /// Link `successor` after this node. Fails if a successor is already
    /// linked or the node has drained.
    fn append(&self, successor: &Arc<Node>) -> bool {
        let none: Option<Arc<Node>> = None;
        let prev = self.next.compare_and_swap(&none, Some(Arc::clone(successor)));
        prev.is_none()
    }

    /// Mark this node drained, or return the successor that beat us to it.
    fn advance(&self) -> Option<Arc<Node>> {
        let none: Option<Arc<Node>> = None;
        let prev = self
            .next
            .compare_and_swap(&none, Some(Arc::clone(drained())));
        match &*prev {
            None => None,
            Some(successor) => Some(Arc::clone(successor)),
        }
    }
}

/// Sentinel stored in a node's `next` link once its chain has finished.
fn drained() -> &'static Arc<Node> {
    static DRAINED: OnceLock<Arc<Node>> = OnceLock::new();
    DRAINED.get_or_init(|| Arc::new(Node::new(None)))
}

fn same_node(a: &Option<Arc<Node>>, b: &Option<Arc<Node>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Chain anchor for one key.
#[derive(Default)]
pub struct SerialLane {
    tail: ArcSwapOption<Node>,
}

impl SerialLane {
    pub fn new() -> Self {
        SerialLane {
            tail: ArcSwapOption::empty(),
        }
    }

    /// True when no job is queued or running on this lane.
    pub fn is_idle(&self) -> bool {
        match &*self.tail.load() {
            None => true,
            Some(tail) => tail.is_drained(),
        }
    }

    fn swap_tail(&self, current: &Option<Arc<Node>>, node: &Arc<Node>) -> bool {
        let prev = self.tail.compare_and_swap(current, Some(Arc::clone(node)));
        same_node(&prev, current)
    }
}

impl std::fmt::Debug for SerialLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLane")
            .field("idle", &self.is_idle())
            .finish()
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Dispatches lane jobs onto a shared [`TaskPool`].
///
/// # Example
///
/// ```no_run
/// use dbcache::scheduler::{SerialLane, SerialScheduler};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let scheduler = SerialScheduler::new(Arc::new(tokio::runtime::Handle::current()));
///     let lane = SerialLane::new();
///
///     scheduler.submit(&lane, Box::pin(async { println!("first") }));
///     scheduler.submit(&lane, Box::pin(async { println!("second") }));
///
///     scheduler.await_termination().await;
/// }
/// ```
#[derive(Clone)]
pub struct SerialScheduler {
    pool: Arc<dyn TaskPool>,
    in_flight: Arc<InFlight>,
}

impl SerialScheduler {
    pub fn new(pool: Arc<dyn TaskPool>) -> Self {
        SerialScheduler {
            pool,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Queue `job` on `lane`. Never blocks.
    pub fn submit(&self, lane: &SerialLane, job: Job) {
        let node = Arc::new(Node::new(Some(job)));
        self.in_flight.enter();

        loop {
            let tail = lane.tail.load_full();
            match &tail {
                None => {
                    if lane.swap_tail(&tail, &node) {
                        self.dispatch(node);
                        return;
                    }
                }
                Some(current) if current.is_drained() => {
                    if lane.swap_tail(&tail, &node) {
                        self.dispatch(node);
                        return;
                    }
                }
                Some(current) => {
                    if current.append(&node) {
                        // Losing this race is fine: a later submitter already moved the tail on.
                        let _ = lane.swap_tail(&tail, &node);
                        return;
                    }
                }
            }
        }
    }

    /// Number of submitted jobs that have not finished yet.
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Wait until every submitted job, on every lane, has finished.
    pub async fn await_termination(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn dispatch(&self, head: Arc<Node>) {
        let in_flight = Arc::clone(&self.in_flight);
        self.pool.spawn(Box::pin(run_chain(head, in_flight)));
    }
}

async fn run_chain(head: Arc<Node>, in_flight: Arc<InFlight>) {
    let mut current = head;
    loop {
        if let Some(job) = current.take_job() {
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Serial job panicked; continuing with the next queued job");
            }
        }
        in_flight.exit();

        match current.advance() {
            Some(next) => current = next,
            None => return,
        }
    }
}
