//! FIFO counting gate with direct hand-off.
//!
//! A [`CountingGate`] admits up to `capacity` concurrent holders. Further
//! acquisitions queue in strict arrival order. A release with a non-empty
//! queue does not put the unit back into the pool: it hands it straight to
//! the oldest waiter, so a newcomer can never slip in between a release and
//! the waiter it was meant for.
//!
//! # Example
//!
//! ```
//! use lanesync::{Capacity, CountingGate};
//!
//! let gate = CountingGate::new(Capacity::bounded(2).unwrap());
//! let first = gate.try_acquire().expect("room");
//! let second = gate.try_acquire().expect("room");
//! assert!(gate.is_locked());
//! drop((first, second));
//! assert_eq!(gate.available(), 2);
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::config::Capacity;
use crate::error::LockError;
use crate::sync::lock::{Guard, Lock};

/// Wakers collected under a lock and woken after it is released.
pub(crate) type WakeList = SmallVec<[Waker; 4]>;

pub(crate) fn wake_all(wakers: WakeList) {
    for waker in wakers {
        waker.wake();
    }
}

/// One-shot grant signal shared by everyone waiting on the same grant.
///
/// Fired exactly once, under the owning gate's lock, when the grant is
/// handed out. Any number of futures may wait on a clone of it.
#[derive(Debug, Clone)]
pub(crate) struct Grant {
    slot: Arc<Mutex<GrantSlot>>,
}

#[derive(Debug, Default)]
struct GrantSlot {
    granted: bool,
    wakers: WakeList,
}

impl Grant {
    fn ready() -> Self {
        Self {
            slot: Arc::new(Mutex::new(GrantSlot {
                granted: true,
                wakers: WakeList::new(),
            })),
        }
    }

    fn waiting() -> Self {
        Self {
            slot: Arc::new(Mutex::new(GrantSlot::default())),
        }
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.slot.lock().granted
    }

    pub(crate) fn poll_granted(&self, context: &mut Context<'_>) -> Poll<()> {
        let mut slot = self.slot.lock();
        if slot.granted {
            return Poll::Ready(());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(context.waker())) {
            slot.wakers.push(context.waker().clone());
        }
        Poll::Pending
    }

    fn fire(&self) -> WakeList {
        let mut slot = self.slot.lock();
        slot.granted = true;
        std::mem::take(&mut slot.wakers)
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

#[derive(Debug)]
struct GateState {
    /// Current holders, including a waiter that was handed a unit but has
    /// not observed it yet.
    holders: usize,
    waiters: VecDeque<Grant>,
    /// Grants handed out over the gate's lifetime.
    grants: u64,
}

#[derive(Debug)]
pub(crate) struct GateCore {
    capacity: Capacity,
    state: Mutex<GateState>,
}

impl GateCore {
    /// Registers one acquisition: granted on the spot if a unit is free and
    /// nobody is queued, otherwise appended to the wait queue.
    pub(crate) fn enqueue(&self) -> Grant {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && self.capacity.admits(state.holders) {
            state.holders += 1;
            state.grants += 1;
            tracing::trace!(holders = state.holders, "gate granted immediately");
            Grant::ready()
        } else {
            let grant = Grant::waiting();
            state.waiters.push_back(grant.clone());
            tracing::trace!(
                holders = state.holders,
                queued = state.waiters.len(),
                "gate acquire queued"
            );
            grant
        }
    }

    /// Gives one unit back, handing it to the oldest waiter if there is one.
    pub(crate) fn release_unit(&self) -> Result<WakeList, LockError> {
        let mut state = self.state.lock();
        if state.holders == 0 {
            tracing::warn!("counting gate released with no outstanding grant");
            return Err(LockError::misuse("CountingGate"));
        }
        let wakers = match state.waiters.pop_front() {
            Some(next) => {
                state.grants += 1;
                tracing::trace!(
                    queued = state.waiters.len(),
                    "gate unit handed to oldest waiter"
                );
                next.fire()
            }
            None => {
                state.holders -= 1;
                WakeList::new()
            }
        };
        Ok(wakers)
    }

    /// Withdraws a registration whose future was dropped before it observed
    /// the outcome.
    fn abandon(&self, grant: &Grant) -> WakeList {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.same(grant)) {
            state.waiters.remove(pos);
            return WakeList::new();
        }
        drop(state);
        // Already handed a unit: pass it on.
        if grant.is_granted() {
            self.release_unit().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "granted unit missing when passing it on");
                WakeList::new()
            })
        } else {
            WakeList::new()
        }
    }

    fn would_block(&self) -> bool {
        let state = self.state.lock();
        !state.waiters.is_empty() || !self.capacity.admits(state.holders)
    }
}

/// A FIFO counting semaphore.
///
/// The gate itself is not `Clone`; sharing one between tasks is done
/// explicitly through `Arc<CountingGate>` or a reference.
#[derive(Debug)]
pub struct CountingGate {
    core: Arc<GateCore>,
}

impl CountingGate {
    /// Creates a gate admitting `capacity` concurrent holders.
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            core: Arc::new(GateCore {
                capacity,
                state: Mutex::new(GateState {
                    holders: 0,
                    waiters: VecDeque::with_capacity(4),
                    grants: 0,
                }),
            }),
        }
    }

    /// Creates a gate from a raw holder count, rejecting zero.
    pub fn with_limit(limit: usize) -> Result<Self, LockError> {
        Ok(Self::new(Capacity::bounded(limit)?))
    }

    /// A mutex: a gate of capacity one.
    #[must_use]
    pub fn mutex() -> Self {
        Self::new(Capacity::ONE)
    }

    /// A gate that never makes anyone wait.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(Capacity::Unbounded)
    }

    /// Another handle to the same gate, for internal composition.
    pub(crate) fn share(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }

    pub(crate) fn core(&self) -> &Arc<GateCore> {
        &self.core
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.core.capacity
    }

    /// Returns the number of current holders.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.core.state.lock().holders
    }

    /// Returns the number of queued acquisitions.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.core.state.lock().waiters.len()
    }

    /// Returns the total number of grants handed out so far.
    #[must_use]
    pub fn grants(&self) -> u64 {
        self.core.state.lock().grants
    }

    /// Units left before acquisitions queue; negative when waiters are
    /// queued (its magnitude is the queue length). Unbounded gates report
    /// `isize::MAX`.
    #[must_use]
    pub fn available(&self) -> isize {
        let Some(limit) = self.core.capacity.limit() else {
            return isize::MAX;
        };
        let state = self.core.state.lock();
        let limit = isize::try_from(limit).unwrap_or(isize::MAX);
        let used = isize::try_from(state.holders + state.waiters.len()).unwrap_or(isize::MAX);
        limit - used
    }

    /// Returns true if an immediate `acquire()` would have to wait.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.core.would_block()
    }

    /// Registers an acquisition and returns a future that resolves to a
    /// permit once a unit is granted.
    ///
    /// The acquisition takes its place in the queue when this method is
    /// called, not when the future is first polled.
    pub fn acquire(&self) -> GateAcquire {
        GateAcquire {
            core: Arc::clone(&self.core),
            grant: Some(self.core.enqueue()),
        }
    }

    /// Acquires a unit only if that would not wait.
    #[must_use]
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let mut state = self.core.state.lock();
        if !state.waiters.is_empty() || !self.core.capacity.admits(state.holders) {
            return None;
        }
        state.holders += 1;
        state.grants += 1;
        drop(state);
        Some(GatePermit::new(Arc::clone(&self.core)))
    }

    /// Releases one unit without a permit, pairing with
    /// [`GatePermit::forget`].
    ///
    /// Returns [`LockError::Misuse`] if no unit is outstanding.
    pub fn release(&self) -> Result<(), LockError> {
        wake_all(self.core.release_unit()?);
        Ok(())
    }
}

impl Lock for CountingGate {
    type Guard = GatePermit;

    fn acquire(&self) -> impl Future<Output = GatePermit> + Send + 'static {
        Self::acquire(self)
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

/// Future returned by [`CountingGate::acquire`].
#[derive(Debug)]
#[must_use = "the acquisition is queued; dropping the future withdraws it"]
pub struct GateAcquire {
    core: Arc<GateCore>,
    grant: Option<Grant>,
}

impl Future for GateAcquire {
    type Output = GatePermit;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(grant) = self.grant.as_ref() else {
            panic!("GateAcquire polled after completion");
        };
        match grant.poll_granted(context) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                self.grant = None;
                Poll::Ready(GatePermit::new(Arc::clone(&self.core)))
            }
        }
    }
}

impl Drop for GateAcquire {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            wake_all(self.core.abandon(&grant));
        }
    }
}

/// One granted unit of a [`CountingGate`].
#[derive(Debug)]
#[must_use = "permit will be immediately released if not held"]
pub struct GatePermit {
    core: Arc<GateCore>,
    released: bool,
}

impl GatePermit {
    fn new(core: Arc<GateCore>) -> Self {
        Self {
            core,
            released: false,
        }
    }

    /// Keeps the unit held without a permit; release it later with
    /// [`CountingGate::release`].
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Guard for GatePermit {
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!("gate permit released twice");
            return Err(LockError::misuse("GatePermit"));
        }
        self.released = true;
        wake_all(self.core.release_unit()?);
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Ok(wakers) = self.core.release_unit() {
                wake_all(wakers);
            }
        }
    }
}
