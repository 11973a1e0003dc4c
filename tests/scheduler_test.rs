//! Lane ordering under contention.
//!
//! Many producers submit to many lanes at once; every lane must still see its
//! own jobs in per-producer submission order, run each exactly once, and
//! never run two of its jobs at the same time.

use dbcache::{SerialLane, SerialScheduler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const LANES: usize = 8;
const PRODUCERS: usize = 4;
const JOBS_PER_PRODUCER: usize = 250;

struct LaneState {
    lane: SerialLane,
    running: AtomicBool,
    log: Mutex<Vec<(usize, usize)>>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_producers_many_lanes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let scheduler = SerialScheduler::new(Arc::new(tokio::runtime::Handle::current()));
    let lanes: Arc<Vec<LaneState>> = Arc::new(
        (0..LANES)
            .map(|_| LaneState {
                lane: SerialLane::new(),
                running: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
            })
            .collect(),
    );
    let overlaps = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let scheduler = scheduler.clone();
            let lanes = Arc::clone(&lanes);
            let overlaps = Arc::clone(&overlaps);
            std::thread::spawn(move || {
                for seq in 0..JOBS_PER_PRODUCER {
                    let index = (producer + seq) % LANES;
                    let lanes_for_job = Arc::clone(&lanes);
                    let overlaps = Arc::clone(&overlaps);
                    scheduler.submit(
                        &lanes[index].lane,
                        Box::pin(async move {
                            let state = &lanes_for_job[index];
                            if state.running.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            tokio::task::yield_now().await;
                            state.log.lock().push((producer, seq));
                            state.running.store(false, Ordering::SeqCst);
                        }),
                    );
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer thread panicked");
    }
    scheduler.await_termination().await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "jobs on one lane overlapped");
    assert_eq!(scheduler.pending(), 0);

    let mut total = 0;
    for state in lanes.iter() {
        assert!(state.lane.is_idle());
        let log = state.log.lock();
        total += log.len();

        for producer in 0..PRODUCERS {
            let seen: Vec<usize> = log
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert!(
                seen.windows(2).all(|w| w[0] < w[1]),
                "producer {} jobs ran out of order",
                producer
            );
        }
    }
    assert_eq!(total, PRODUCERS * JOBS_PER_PRODUCER, "every job ran exactly once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lanes_run_in_parallel() {
    let scheduler = SerialScheduler::new(Arc::new(tokio::runtime::Handle::current()));
    let blocked = SerialLane::new();
    let free = SerialLane::new();
    let gate = Arc::new(tokio::sync::Notify::new());
    let done = Arc::new(AtomicBool::new(false));

    let wait = Arc::clone(&gate);
    scheduler.submit(
        &blocked,
        Box::pin(async move {
            wait.notified().await;
        }),
    );

    let flag = Arc::clone(&done);
    scheduler.submit(
        &free,
        Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
        }),
    );

    // The free lane finishes while the blocked lane is still waiting.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !done.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("independent lane was blocked");
    assert!(!blocked.is_idle());

    gate.notify_one();
    scheduler.await_termination().await;
    assert!(blocked.is_idle());
}
