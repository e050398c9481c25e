//! Contention scenarios driven by a single-threaded executor.
//!
//! Many tasks hammer the same locks, yielding inside their critical
//! sections so that every suspension point is interleaved. Each scenario
//! checks the exclusion property it is about and that every task finished
//! (nothing was left waiting on a grant that never came).

mod common {
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("TEST_LOG_LEVEL")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    }
}

macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use futures_lite::future::yield_now;
use lanesync::{Capacity, CountingGate, LaneGraph, LaneSpec, Lock, ReadWriteLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

/// Tracks how many tasks are inside a section and the peak seen.
#[derive(Debug, Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        now
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn now(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[test]
fn counting_gate_never_exceeds_capacity() {
    init_test("counting_gate_never_exceeds_capacity");
    const TASKS: usize = 24;
    const LIMIT: usize = 3;

    let gate = Arc::new(CountingGate::with_limit(LIMIT).expect("positive limit"));
    let inside = Arc::new(Occupancy::default());
    let finished = Arc::new(AtomicUsize::new(0));
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    for task in 0..TASKS {
        let gate = Arc::clone(&gate);
        let inside = Arc::clone(&inside);
        let finished = Arc::clone(&finished);
        spawner
            .spawn_local(async move {
                let occupancy = &inside;
                gate.scoped(move || async move {
                    occupancy.enter();
                    for _ in 0..(task % 4) + 1 {
                        yield_now().await;
                    }
                    occupancy.leave();
                })
                .await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn");
    }
    pool.run_until_stalled();

    let done = finished.load(Ordering::SeqCst);
    assert_with_log!(done == TASKS, "all tasks finished", TASKS, done);
    assert_with_log!(inside.peak() <= LIMIT, "peak within capacity", LIMIT, inside.peak());
    assert_with_log!(inside.peak() == LIMIT, "capacity used", LIMIT, inside.peak());
    assert_with_log!(gate.available() == 3, "all units back", 3, gate.available());
    test_complete!("counting_gate_never_exceeds_capacity");
}

#[test]
fn writers_never_overlap_readers_or_each_other() {
    init_test("writers_never_overlap_readers_or_each_other");
    const TASKS: usize = 32;

    let rw = ReadWriteLock::new();
    let readers = Arc::new(Occupancy::default());
    let writers = Arc::new(Occupancy::default());
    let violations = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    for task in 0..TASKS {
        let rw = rw.clone();
        let readers = Arc::clone(&readers);
        let writers = Arc::clone(&writers);
        let violations = Arc::clone(&violations);
        let finished = Arc::clone(&finished);
        spawner
            .spawn_local(async move {
                for round in 0..3 {
                    if (task + round) % 5 == 0 {
                        let guard = rw.write().acquire().await;
                        if writers.enter() > 1 || readers.now() > 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        yield_now().await;
                        writers.leave();
                        drop(guard);
                    } else {
                        let guard = rw.read().acquire().await;
                        readers.enter();
                        if writers.now() > 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        yield_now().await;
                        readers.leave();
                        drop(guard);
                    }
                    yield_now().await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn");
    }
    pool.run_until_stalled();

    let done = finished.load(Ordering::SeqCst);
    assert_with_log!(done == TASKS, "all tasks finished", TASKS, done);
    let seen = violations.load(Ordering::SeqCst);
    assert_with_log!(seen == 0, "no overlap", 0, seen);
    assert_with_log!(readers.peak() > 1, "reads ran concurrently", "> 1", readers.peak());
    assert_with_log!(!rw.write().is_locked(), "idle afterwards", false, rw.write().is_locked());
    test_complete!("writers_never_overlap_readers_or_each_other");
}

#[test]
fn blocking_lane_holds_back_its_sibling() {
    init_test("blocking_lane_holds_back_its_sibling");
    const WORKERS: usize = 12;

    let graph = LaneGraph::from_specs([
        LaneSpec::new("jobs", Vec::<String>::new(), Capacity::bounded(4).expect("four")),
        LaneSpec::new("maintenance", ["jobs"], Capacity::ONE),
    ])
    .expect("valid graph");
    let jobs = Arc::new(Occupancy::default());
    let maintenance = Arc::new(Occupancy::default());
    let violations = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    for worker in 0..WORKERS {
        let graph = graph.clone();
        let jobs = Arc::clone(&jobs);
        let maintenance = Arc::clone(&maintenance);
        let violations = Arc::clone(&violations);
        let finished = Arc::clone(&finished);
        spawner
            .spawn_local(async move {
                for round in 0..4 {
                    let lane = if (worker * 4 + round) % 7 == 0 { "maintenance" } else { "jobs" };
                    let (mine, other) = if lane == "jobs" {
                        (&jobs, &maintenance)
                    } else {
                        (&maintenance, &jobs)
                    };
                    let violations = &violations;
                    graph
                        .scoped(lane, move || async move {
                            mine.enter();
                            if other.now() > 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            yield_now().await;
                            mine.leave();
                        })
                        .await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn");
    }
    pool.run_until_stalled();

    let done = finished.load(Ordering::SeqCst);
    assert_with_log!(done == WORKERS, "all workers finished", WORKERS, done);
    let seen = violations.load(Ordering::SeqCst);
    assert_with_log!(seen == 0, "maintenance ran alone", 0, seen);
    assert_with_log!(jobs.peak() <= 4, "jobs within capacity", 4, jobs.peak());
    assert_with_log!(maintenance.peak() == 1, "maintenance exclusive", 1, maintenance.peak());
    test_complete!("blocking_lane_holds_back_its_sibling");
}
