//! Fair read-write lock built from two lanes.
//!
//! [`ReadWriteLock`] is a [`LaneGraph`] with two permanently registered
//! lanes:
//!
//! | Lane    | Capacity  | Blocks |
//! |---------|-----------|--------|
//! | `read`  | unbounded | nothing |
//! | `write` | 1         | `read` |
//!
//! ## Fairness
//!
//! - Readers admitted before a writer arrived are never revoked; the writer
//!   is admitted once all of them have left.
//! - Readers arriving after a writer wait for that writer to finish.
//! - Writers queue on their own lane in arrival order. Consecutive writers
//!   share one split of the read lane, so readers queued behind them wait
//!   for the whole writer run.
//!
//! Neither side can starve the other: every arrival is admitted after the
//! finite set of holders that arrived before it.
//!
//! # Example
//!
//! ```
//! use lanesync::{Lock, ReadWriteLock};
//!
//! futures_lite::future::block_on(async {
//!     let rw = ReadWriteLock::new();
//!     let r1 = rw.read().acquire().await;
//!     let r2 = rw.read().acquire().await;
//!     assert!(rw.write().is_locked());
//!     drop((r1, r2));
//!     rw.write().scoped(|| async {}).await;
//! });
//! ```

use crate::config::Capacity;
use crate::sync::lane::{Lane, LaneGraph};

/// Name of the shared lane.
pub const READ_LANE: &str = "read";
/// Name of the exclusive lane.
pub const WRITE_LANE: &str = "write";

/// A read-write lock with arrival-order fairness between readers and
/// writers.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
    graph: LaneGraph,
    read: Lane,
    write: Lane,
}

impl ReadWriteLock {
    /// Creates an unlocked read-write lock.
    #[must_use]
    pub fn new() -> Self {
        let graph = LaneGraph::new();
        let read = graph.register(READ_LANE, std::iter::empty(), Capacity::Unbounded);
        let write = graph.register(WRITE_LANE, [READ_LANE], Capacity::ONE);
        Self { graph, read, write }
    }

    /// The shared lane.
    #[must_use]
    pub fn read(&self) -> &Lane {
        &self.read
    }

    /// The exclusive lane.
    #[must_use]
    pub fn write(&self) -> &Lane {
        &self.write
    }

    /// The underlying lane graph.
    #[must_use]
    pub fn graph(&self) -> &LaneGraph {
        &self.graph
    }
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}
