//! Generation-split gate that lets a blocker overtake newcomers without
//! starving anyone.
//!
//! A [`PhaseGate`] keeps an ordered list of *generations*, each a
//! [`CountingGate`] of the configured capacity, plus a [`KeyedStack`]
//! turnstile keyed by blocker identity.
//!
//! - Ordinary acquisitions take a unit from the newest generation. If that
//!   generation has no holders yet they first take a null-keyed turnstile
//!   ticket, which queues them behind any blocker already declared. Their
//!   gate registrations are parked on the generation and made in claim
//!   order once the ticket is granted.
//! - A blocker (`lock(Some(name))`) that starts a new turnstile run opens a
//!   new generation. It is admitted once its run holds the turnstile and
//!   every older generation has drained.
//! - After every release, a drained oldest generation with a newer one
//!   behind it is dropped.
//!
//! Consecutive declarations of the same blocker collapse into one run on the
//! turnstile, so a stream of them shares one generation split.
//!
//! # Invariants
//!
//! - There is always at least one generation.
//! - Holders only ever exist in the oldest generation, and in a newer one
//!   only once everything older has drained.
//! - A generation is never dropped while someone that targeted it has not
//!   released.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::Capacity;
use crate::error::LockError;
use crate::sync::gate::{CountingGate, GateAcquire, GatePermit, WakeList, wake_all};
use crate::sync::keyed_stack::{KeyedStack, StackAcquire, StackHold};
use crate::sync::lock::{Guard, Lock};

/// Turnstile key: a blocker's name, or `None` for ordinary intent.
pub(crate) type BlockerKey = Option<Arc<str>>;

/// Gate registration of a ticket-taker, filled in once its ticket is granted.
type Slot = Arc<Mutex<Option<GateAcquire>>>;

#[derive(Debug)]
struct Generation {
    id: u64,
    gate: CountingGate,
    /// Holders plus acquisitions that targeted this generation and have not
    /// been granted yet.
    claims: usize,
    /// Ticket-takers not yet registered on `gate`, oldest first.
    parked: VecDeque<Slot>,
}

#[derive(Debug)]
struct PhaseState {
    generations: VecDeque<Generation>,
    next_generation: u64,
    /// Blockers waiting for older generations to drain.
    drain_waiters: WakeList,
}

impl PhaseState {
    fn open_generation(&mut self, capacity: Capacity) -> u64 {
        let id = self.next_generation;
        self.next_generation += 1;
        self.generations.push_back(Generation {
            id,
            gate: CountingGate::new(capacity),
            claims: 0,
            parked: VecDeque::new(),
        });
        id
    }

    /// The newest generation, reopening one if none is live.
    fn newest(&mut self, capacity: Capacity) -> &mut Generation {
        if self.generations.is_empty() {
            self.open_generation(capacity);
        }
        let last = self.generations.len() - 1;
        &mut self.generations[last]
    }

    fn generation_mut(&mut self, id: u64) -> Option<&mut Generation> {
        self.generations.iter_mut().find(|g| g.id == id)
    }

    fn oldest_id(&self) -> u64 {
        self.generations.front().map_or(self.next_generation, |g| g.id)
    }

    /// Drops drained generations from the front while a newer one exists.
    fn collect(&mut self) -> WakeList {
        let mut retired = false;
        while self.generations.len() > 1 && self.generations.front().is_some_and(|g| g.claims == 0) {
            if let Some(generation) = self.generations.pop_front() {
                tracing::debug!(
                    generation = generation.id,
                    remaining = self.generations.len(),
                    "generation drained"
                );
            }
            retired = true;
        }
        if retired {
            std::mem::take(&mut self.drain_waiters)
        } else {
            WakeList::new()
        }
    }
}

#[derive(Debug)]
struct PhaseCore {
    capacity: Capacity,
    turnstile: KeyedStack<BlockerKey>,
    state: Mutex<PhaseState>,
}

impl PhaseCore {
    /// Registers a turnstile declaration, opening a generation if a blocker
    /// starts a new run. Returns the ticket and, for blockers, the
    /// generation that must become the oldest before admission.
    fn declare(&self, key: BlockerKey) -> (StackAcquire<BlockerKey>, Option<u64>) {
        let mut state = self.state.lock();
        let ticket = self.turnstile.acquire(key.clone());
        let target = key.map(|blocker| {
            if ticket.started_run() {
                let id = state.open_generation(self.capacity);
                tracing::debug!(blocker = %blocker, generation = id, "generation opened");
            }
            // A joining blocker shares the newest run, which opened the
            // newest generation.
            state.generations.back().map_or(0, |g| g.id)
        });
        let wakers = state.collect();
        drop(state);
        wake_all(wakers);
        (ticket, target)
    }

    /// Claims a unit of the newest generation.
    fn claim(self: &Arc<Self>) -> Claimed {
        let mut state = self.state.lock();
        let generation = state.newest(self.capacity);
        generation.claims += 1;
        let id = generation.id;
        let entry = if generation.gate.holders() == 0 {
            let slot = Slot::default();
            generation.parked.push_back(Arc::clone(&slot));
            let gate = generation.gate.share();
            Entry::Ticket(
                self.turnstile.acquire(None),
                Parked {
                    core: Arc::clone(self),
                    generation: id,
                    gate,
                    slot,
                },
            )
        } else {
            Entry::Unit(generation.gate.acquire())
        };
        drop(state);
        tracing::trace!(
            generation = id,
            ticket = matches!(entry, Entry::Ticket(..)),
            "phase unit claimed"
        );
        Claimed {
            claim: Claim {
                core: Arc::clone(self),
                generation: id,
                settled: false,
            },
            entry,
        }
    }

    /// Registers every parked ticket-taker of `generation` on its gate, in
    /// claim order.
    fn admit(&self, generation: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.generation_mut(generation) else {
            return;
        };
        let admitted = entry.parked.len();
        while let Some(slot) = entry.parked.pop_front() {
            *slot.lock() = Some(entry.gate.acquire());
        }
        if admitted > 0 {
            tracing::trace!(generation, admitted, "parked acquisitions registered");
        }
    }

    /// Removes a parked slot whose acquisition went away.
    fn unpark(&self, generation: u64, slot: &Slot) {
        let mut state = self.state.lock();
        if let Some(entry) = state.generation_mut(generation) {
            entry.parked.retain(|parked| !Arc::ptr_eq(parked, slot));
        }
    }

    /// Drops one claim on `generation` and collects drained generations.
    fn settle(&self, generation: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.generation_mut(generation) {
            entry.claims -= 1;
        }
        let wakers = state.collect();
        drop(state);
        wake_all(wakers);
    }

    fn collect(&self) {
        let wakers = self.state.lock().collect();
        wake_all(wakers);
    }
}

struct Claimed {
    claim: Claim,
    entry: Entry,
}

enum Entry {
    /// Queued on the generation's gate directly.
    Unit(GateAcquire),
    /// Waiting for a turnstile ticket before touching the gate.
    Ticket(StackAcquire<BlockerKey>, Parked),
}

/// A ticket-taker's place in its generation's parked queue.
#[derive(Debug)]
struct Parked {
    core: Arc<PhaseCore>,
    generation: u64,
    gate: CountingGate,
    slot: Slot,
}

impl Parked {
    /// Called once the ticket is granted. Registers everyone parked ahead
    /// of this acquisition first, then this one.
    fn admit(self) -> GateAcquire {
        self.core.admit(self.generation);
        let registration = self.slot.lock().take();
        registration.unwrap_or_else(|| self.gate.acquire())
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        self.core.unpark(self.generation, &self.slot);
        // Registered on our behalf but never picked up: hand the unit on.
        let registration = self.slot.lock().take();
        drop(registration);
    }
}

/// One outstanding claim on a generation; settled exactly once.
#[derive(Debug)]
struct Claim {
    core: Arc<PhaseCore>,
    generation: u64,
    settled: bool,
}

impl Claim {
    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.core.settle(self.generation);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Waits until every generation older than `target` has drained.
#[derive(Debug)]
struct Drained {
    core: Arc<PhaseCore>,
    target: u64,
}

impl Future for Drained {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<()> {
        let mut state = self.core.state.lock();
        if state.oldest_id() >= self.target {
            return Poll::Ready(());
        }
        if !state.drain_waiters.iter().any(|w| w.will_wake(context.waker())) {
            state.drain_waiters.push(context.waker().clone());
        }
        Poll::Pending
    }
}

/// A sequence of equal-capacity generations behind a blocker turnstile.
#[derive(Debug)]
pub struct PhaseGate {
    core: Arc<PhaseCore>,
}

impl PhaseGate {
    /// Creates a phase gate whose generations admit `capacity` holders.
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        let mut state = PhaseState {
            generations: VecDeque::with_capacity(2),
            next_generation: 0,
            drain_waiters: WakeList::new(),
        };
        state.open_generation(capacity);
        Self {
            core: Arc::new(PhaseCore {
                capacity,
                turnstile: KeyedStack::new(),
                state: Mutex::new(state),
            }),
        }
    }

    /// Returns the per-generation capacity.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.core.capacity
    }

    /// Declares intent on the turnstile.
    ///
    /// `None` is ordinary intent: it waits its turn on the turnstile and
    /// opens nothing. `Some(blocker)` opens a new generation unless the
    /// newest turnstile run already belongs to the same blocker, and is only
    /// admitted after the generations before it drain.
    pub fn lock(&self, blocker: Option<&str>) -> impl Future<Output = PhaseLock> + Send + 'static {
        self.lock_as(blocker.map(Arc::from))
    }

    pub(crate) fn lock_as(
        &self,
        blocker: BlockerKey,
    ) -> impl Future<Output = PhaseLock> + Send + 'static + use<> {
        let core = Arc::clone(&self.core);
        let (ticket, target) = core.declare(blocker);
        async move {
            let hold = ticket.await;
            if let Some(target) = target {
                Drained {
                    core: Arc::clone(&core),
                    target,
                }
                .await;
            }
            PhaseLock {
                core,
                hold,
                released: false,
            }
        }
    }

    /// Registers an ordinary acquisition of one unit of the newest
    /// generation.
    pub fn acquire(&self) -> impl Future<Output = PhasePermit> + Send + 'static + use<> {
        let Claimed { claim, entry } = self.core.claim();
        async move {
            let (ticket, unit) = match entry {
                Entry::Unit(unit) => (None, unit.await),
                Entry::Ticket(ticket, parked) => {
                    let hold = ticket.await;
                    let unit = parked.admit();
                    (Some(hold), unit.await)
                }
            };
            PhasePermit {
                claim,
                unit,
                ticket,
                released: false,
            }
        }
    }

    /// Number of live generations.
    #[must_use]
    pub fn generations(&self) -> usize {
        self.core.state.lock().generations.len()
    }

    /// Holders across all generations.
    #[must_use]
    pub fn holders(&self) -> usize {
        let state = self.core.state.lock();
        state.generations.iter().map(|g| g.gate.holders()).sum()
    }

    /// Number of turnstile runs holding or queued.
    #[must_use]
    pub fn turnstile_runs(&self) -> usize {
        self.core.turnstile.runs()
    }

    /// Key of the newest turnstile run; `None` when the turnstile is idle,
    /// `Some(None)` for an ordinary run.
    #[must_use]
    pub fn turnstile_key(&self) -> Option<Option<String>> {
        self.core
            .turnstile
            .current_key()
            .map(|key| key.map(|name| name.to_string()))
    }

    /// Returns true if an immediate ordinary `acquire()` would wait.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        let state = self.core.state.lock();
        match state.generations.back() {
            Some(newest) if newest.gate.holders() == 0 => {
                self.core.turnstile.would_block(&None)
                    || !self.core.capacity.admits(newest.parked.len())
            }
            Some(newest) => newest.gate.is_locked(),
            None => false,
        }
    }

    /// Returns true if `lock(blocker)` would wait.
    pub(crate) fn would_block_lock(&self, blocker: &BlockerKey) -> bool {
        let state = self.core.state.lock();
        if self.core.turnstile.would_block(blocker) {
            return true;
        }
        if blocker.is_none() {
            return false;
        }
        let joins = self.core.turnstile.current_key().as_ref() == Some(blocker);
        // A new blocker run waits for every claimed generation; a joining one
        // only for those older than its own.
        let older = if joins {
            state.generations.len().saturating_sub(1)
        } else {
            state.generations.len()
        };
        state.generations.iter().take(older).any(|g| g.claims > 0)
    }
}

impl Lock for PhaseGate {
    type Guard = PhasePermit;

    fn acquire(&self) -> impl Future<Output = PhasePermit> + Send + 'static {
        Self::acquire(self)
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

/// A granted turnstile declaration; releasing it is `unlock`.
#[derive(Debug)]
#[must_use = "lock will be immediately released if not held"]
pub struct PhaseLock {
    core: Arc<PhaseCore>,
    hold: StackHold<BlockerKey>,
    released: bool,
}

impl Guard for PhaseLock {
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!("phase lock released twice");
            return Err(LockError::misuse("PhaseLock"));
        }
        self.released = true;
        let result = self.hold.release();
        self.core.collect();
        result
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for PhaseLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

/// One granted unit of a [`PhaseGate`] generation.
#[derive(Debug)]
#[must_use = "permit will be immediately released if not held"]
pub struct PhasePermit {
    claim: Claim,
    unit: GatePermit,
    ticket: Option<StackHold<BlockerKey>>,
    released: bool,
}

impl PhasePermit {
    /// Id of the generation this unit was taken from.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.claim.generation
    }

    /// Returns true if this acquisition had to take a turnstile ticket.
    #[must_use]
    pub fn took_ticket(&self) -> bool {
        self.ticket.is_some()
    }
}

impl Guard for PhasePermit {
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!("phase permit released twice");
            return Err(LockError::misuse("PhasePermit"));
        }
        self.released = true;
        let unit = self.unit.release();
        let ticket = self.ticket.as_mut().map_or(Ok(()), Guard::release);
        self.claim.settle();
        unit.and(ticket)
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for PhasePermit {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
