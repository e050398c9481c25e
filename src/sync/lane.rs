//! Named exclusion lanes that block one another.
//!
//! A [`LaneGraph`] owns a set of named lanes. Each lane is a [`PhaseGate`]
//! sized to the lane's capacity plus the names of the sibling lanes it
//! blocks. Holding lane `A` that blocks lane `B` means new `B` acquisitions
//! are pushed into a fresh generation of `B`'s phase gate that admits only
//! after `A` and every `B` holder admitted before `A` arrived have left.
//! Existing holders are never revoked.
//!
//! Lanes that do not block each other have no ordering relative to each
//! other.
//!
//! # Example
//!
//! ```
//! use lanesync::{Capacity, LaneGraph, LaneSpec};
//!
//! let graph = LaneGraph::from_specs([
//!     LaneSpec::new("jobs", Vec::<String>::new(), Capacity::bounded(4).unwrap()),
//!     LaneSpec::new("maintenance", ["jobs"], Capacity::ONE),
//! ])
//! .unwrap();
//!
//! let done = futures_lite::future::block_on(graph.scoped("maintenance", || async { "swept" }));
//! assert_eq!(done, "swept");
//! ```

use futures::future::{join, join_all};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::config::{Capacity, LaneSpec, validate_lane_specs};
use crate::error::LockError;
use crate::sync::lock::{Guard, Lock};
use crate::sync::phase::{BlockerKey, PhaseGate, PhaseLock, PhasePermit};

#[derive(Debug)]
struct LaneCore {
    name: Arc<str>,
    blocks: Vec<Arc<str>>,
    phase: PhaseGate,
}

impl LaneCore {
    fn new(name: Arc<str>, blocks: Vec<Arc<str>>, capacity: Capacity) -> Self {
        Self {
            name,
            blocks,
            phase: PhaseGate::new(capacity),
        }
    }
}

/// Name → lane arena. Lanes never point back at it; handles carry the
/// arena alongside the lane instead.
#[derive(Debug, Default)]
struct GraphCore {
    lanes: Mutex<HashMap<Arc<str>, Arc<LaneCore>>>,
}

impl GraphCore {
    fn resolve(&self, name: &str) -> Arc<LaneCore> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(name) {
            return Arc::clone(lane);
        }
        let name: Arc<str> = Arc::from(name);
        tracing::debug!(lane = %name, "creating default lane");
        let lane = Arc::new(LaneCore::new(Arc::clone(&name), Vec::new(), Capacity::Unbounded));
        lanes.insert(name, Arc::clone(&lane));
        lane
    }
}

/// A registry of named lanes.
#[derive(Debug, Clone, Default)]
pub struct LaneGraph {
    core: Arc<GraphCore>,
}

impl LaneGraph {
    /// Creates an empty graph; every lane it hands out is a default lane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from lane descriptions.
    ///
    /// Fails with [`LockError::Configuration`] on an empty or duplicate
    /// name, a lane that blocks itself, or a blocking cycle. Lanes named in
    /// `blocks` without a description of their own become default lanes.
    pub fn from_specs<I>(specs: I) -> Result<Self, LockError>
    where
        I: IntoIterator<Item = LaneSpec>,
    {
        let specs: Vec<LaneSpec> = specs.into_iter().collect();
        validate_lane_specs(&specs)?;
        let graph = Self::new();
        for spec in specs {
            graph.register(&spec.name, spec.blocks.iter().map(String::as_str), spec.capacity);
        }
        Ok(graph)
    }

    /// Installs a lane, replacing any lane of the same name.
    pub(crate) fn register<'a>(
        &self,
        name: &str,
        blocks: impl IntoIterator<Item = &'a str>,
        capacity: Capacity,
    ) -> Lane {
        let name: Arc<str> = Arc::from(name);
        let blocks: Vec<Arc<str>> = blocks.into_iter().map(Arc::from).collect();
        tracing::debug!(lane = %name, blocks = ?blocks, capacity = %capacity, "lane registered");
        let lane = Arc::new(LaneCore::new(Arc::clone(&name), blocks, capacity));
        self.core.lanes.lock().insert(name, Arc::clone(&lane));
        Lane {
            graph: Arc::clone(&self.core),
            core: lane,
        }
    }

    /// Returns the lane called `name`, creating an unbounded lane that
    /// blocks nothing if there is none.
    #[must_use]
    pub fn lane(&self, name: &str) -> Lane {
        Lane {
            graph: Arc::clone(&self.core),
            core: self.core.resolve(name),
        }
    }

    /// Returns true if a lane called `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.core.lanes.lock().contains_key(name)
    }

    /// Names of every lane in the graph, sorted.
    #[must_use]
    pub fn lane_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .core
            .lanes
            .lock()
            .keys()
            .map(|name| name.to_string())
            .collect();
        names.sort_unstable();
        names
    }

    /// Acquires the lane called `name`.
    pub fn acquire(&self, name: &str) -> impl Future<Output = LaneGuard> + Send + 'static {
        self.lane(name).acquire()
    }

    /// Runs `critical_section` while holding the lane called `name`.
    pub fn scoped<F, Fut>(&self, name: &str, critical_section: F) -> impl Future<Output = Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let lane = self.lane(name);
        async move { lane.scoped(critical_section).await }
    }
}

/// Handle to one lane of a [`LaneGraph`].
#[derive(Debug, Clone)]
pub struct Lane {
    graph: Arc<GraphCore>,
    core: Arc<LaneCore>,
}

impl Lane {
    /// The lane's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Names of the lanes this lane blocks while held.
    pub fn blocks(&self) -> impl Iterator<Item = &str> {
        self.core.blocks.iter().map(AsRef::as_ref)
    }

    /// Concurrent holders this lane admits.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.core.phase.capacity()
    }

    /// Current holders of this lane.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.core.phase.holders()
    }

    fn siblings(&self) -> Vec<Arc<LaneCore>> {
        self.core
            .blocks
            .iter()
            .map(|name| self.graph.resolve(name))
            .collect()
    }

    /// Registers an acquisition of this lane.
    ///
    /// Three things are declared at once and joined: ordinary intent on
    /// this lane's turnstile, a capacity unit of this lane, and this lane as
    /// a blocker on every sibling it blocks. They may complete in any order.
    pub fn acquire(&self) -> impl Future<Output = LaneGuard> + Send + 'static + use<> {
        let name = Arc::clone(&self.core.name);
        let lock = self.core.phase.lock_as(None);
        let permit = self.core.phase.acquire();
        let blocker: BlockerKey = Some(Arc::clone(&name));
        let sibling_locks: Vec<_> = self
            .siblings()
            .iter()
            .map(|sibling| sibling.phase.lock_as(blocker.clone()))
            .collect();
        tracing::trace!(lane = %name, siblings = sibling_locks.len(), "lane acquire registered");
        async move {
            let ((lock, permit), siblings) = join(join(lock, permit), join_all(sibling_locks)).await;
            tracing::debug!(lane = %name, generation = permit.generation(), "lane acquired");
            LaneGuard {
                lane: name,
                siblings,
                lock,
                permit,
                released: false,
            }
        }
    }

    /// Returns true if an immediate `acquire()` would have to wait.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        if self.core.phase.is_locked() || self.core.phase.would_block_lock(&None) {
            return true;
        }
        let blocker: BlockerKey = Some(Arc::clone(&self.core.name));
        self.siblings()
            .iter()
            .any(|sibling| sibling.phase.would_block_lock(&blocker))
    }
}

impl Lock for Lane {
    type Guard = LaneGuard;

    fn acquire(&self) -> impl Future<Output = LaneGuard> + Send + 'static {
        Self::acquire(self)
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

/// A held lane.
#[derive(Debug)]
#[must_use = "lane will be immediately released if not held"]
pub struct LaneGuard {
    lane: Arc<str>,
    siblings: Vec<PhaseLock>,
    lock: PhaseLock,
    permit: PhasePermit,
    released: bool,
}

impl LaneGuard {
    /// Name of the held lane.
    #[must_use]
    pub fn lane(&self) -> &str {
        &self.lane
    }
}

impl Guard for LaneGuard {
    /// Unlocks the blocked siblings, then this lane's turnstile, then gives
    /// back the capacity unit. Returns the first error encountered.
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!(lane = %self.lane, "lane released twice");
            return Err(LockError::misuse("LaneGuard"));
        }
        self.released = true;
        let mut result = Ok(());
        for sibling in &mut self.siblings {
            result = result.and(sibling.release());
        }
        result = result.and(self.lock.release());
        result = result.and(self.permit.release());
        tracing::debug!(lane = %self.lane, "lane released");
        result
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
