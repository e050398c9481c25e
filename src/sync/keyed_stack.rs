//! Reentrant run-collapsing stack over a capacity-1 gate.
//!
//! Consecutive acquisitions that share a key form a *run*. A run takes the
//! underlying gate once, however many members join it, and gives it back
//! only after every member has released. A different key always starts a new
//! run queued behind the previous one, so keys take turns in arrival order.
//!
//! Releases are anonymous and always count against the oldest run; since
//! only the oldest run can be holding the gate, every live holder belongs to
//! it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::LockError;
use crate::sync::gate::{CountingGate, Grant, WakeList, wake_all};
use crate::sync::lock::Guard;

/// Bounds required of a key.
pub trait StackKey: Clone + PartialEq + fmt::Debug + Send + 'static {}

impl<K: Clone + PartialEq + fmt::Debug + Send + 'static> StackKey for K {}

#[derive(Debug)]
struct Run<K> {
    id: u64,
    key: K,
    /// Members that joined and have not released yet.
    pending: usize,
    grant: Grant,
}

#[derive(Debug)]
struct StackState<K> {
    runs: VecDeque<Run<K>>,
    next_run: u64,
}

#[derive(Debug)]
struct StackCore<K> {
    gate: CountingGate,
    state: Mutex<StackState<K>>,
}

impl<K: StackKey> StackCore<K> {
    fn enter(self: &Arc<Self>, key: K) -> StackAcquire<K> {
        let mut state = self.state.lock();
        if let Some(run) = state.runs.back_mut().filter(|run| run.key == key) {
            run.pending += 1;
            tracing::trace!(key = ?run.key, pending = run.pending, "joined run");
            return StackAcquire {
                core: Arc::clone(self),
                run: run.id,
                grant: Some(run.grant.clone()),
                started: false,
            };
        }
        let id = state.next_run;
        state.next_run += 1;
        // Enqueue while holding the stack lock so gate order matches run order.
        let grant = self.gate.core().enqueue();
        tracing::trace!(key = ?key, runs = state.runs.len() + 1, "run started");
        state.runs.push_back(Run {
            id,
            key,
            pending: 1,
            grant: grant.clone(),
        });
        StackAcquire {
            core: Arc::clone(self),
            run: id,
            grant: Some(grant),
            started: true,
        }
    }

    /// Counts one release against the oldest run.
    fn leave(&self) -> Result<WakeList, LockError> {
        let mut state = self.state.lock();
        let Some(front) = state.runs.front_mut() else {
            tracing::warn!("keyed stack released with no outstanding run");
            return Err(LockError::misuse("KeyedStack"));
        };
        front.pending -= 1;
        let mut wakers = WakeList::new();
        if front.pending == 0 {
            self.retire_front(&mut state, &mut wakers)?;
        }
        Ok(wakers)
    }

    /// Pops the drained oldest run and hands the gate on. Runs whose members
    /// all went away before being granted are retired as they come up.
    fn retire_front(
        &self,
        state: &mut StackState<K>,
        wakers: &mut WakeList,
    ) -> Result<(), LockError> {
        while let Some(run) = state.runs.pop_front() {
            tracing::trace!(key = ?run.key, "run drained");
            wakers.extend(self.gate.core().release_unit()?);
            if state.runs.front().is_none_or(|next| next.pending > 0) {
                break;
            }
        }
        Ok(())
    }

    /// A member dropped its acquisition before observing the grant.
    fn abandon(&self, run_id: u64) -> WakeList {
        let mut state = self.state.lock();
        let Some(pos) = state.runs.iter().position(|run| run.id == run_id) else {
            return WakeList::new();
        };
        state.runs[pos].pending -= 1;
        let mut wakers = WakeList::new();
        if pos == 0 && state.runs[0].pending == 0 {
            // The oldest run always holds the gate.
            let _ = self.retire_front(&mut state, &mut wakers);
        }
        wakers
    }
}

/// A FIFO stack of key runs sharing one capacity-1 gate.
#[derive(Debug)]
pub struct KeyedStack<K> {
    core: Arc<StackCore<K>>,
}

impl<K: StackKey> KeyedStack<K> {
    /// Creates an idle stack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(StackCore {
                gate: CountingGate::mutex(),
                state: Mutex::new(StackState {
                    runs: VecDeque::new(),
                    next_run: 0,
                }),
            }),
        }
    }

    /// Registers an acquisition under `key`.
    ///
    /// Joins the newest run if it has the same key (no new gate
    /// acquisition); otherwise starts a new run queued behind the others.
    pub fn acquire(&self, key: K) -> StackAcquire<K> {
        self.core.enter(key)
    }

    /// Releases one hold of the oldest run without a [`StackHold`].
    ///
    /// Returns [`LockError::Misuse`] when nothing is held.
    pub fn release(&self) -> Result<(), LockError> {
        wake_all(self.core.leave()?);
        Ok(())
    }

    /// Key of the newest run, or `None` when the stack is idle.
    #[must_use]
    pub fn current_key(&self) -> Option<K> {
        self.core.state.lock().runs.back().map(|run| run.key.clone())
    }

    /// Number of runs holding or queued for the gate.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.core.state.lock().runs.len()
    }

    /// Outstanding members of the oldest run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.state.lock().runs.front().map_or(0, |run| run.pending)
    }

    /// Returns true while any run holds the gate.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.core.state.lock().runs.is_empty()
    }

    /// Returns true if `acquire(key)` would have to wait.
    #[must_use]
    pub fn would_block(&self, key: &K) -> bool {
        let state = self.core.state.lock();
        match state.runs.len() {
            0 => false,
            1 => state.runs.back().is_none_or(|run| run.key != *key),
            _ => true,
        }
    }

    /// The underlying capacity-1 gate.
    #[must_use]
    pub fn gate(&self) -> &CountingGate {
        &self.core.gate
    }
}

impl<K: StackKey> Default for KeyedStack<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`KeyedStack::acquire`].
#[must_use = "the acquisition is queued; dropping the future withdraws it"]
pub struct StackAcquire<K: StackKey> {
    core: Arc<StackCore<K>>,
    run: u64,
    grant: Option<Grant>,
    started: bool,
}

impl<K: StackKey> StackAcquire<K> {
    /// Returns true if this acquisition started a new run rather than
    /// joining the newest one.
    #[must_use]
    pub fn started_run(&self) -> bool {
        self.started
    }
}

impl<K: StackKey> fmt::Debug for StackAcquire<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackAcquire")
            .field("run", &self.run)
            .field("started", &self.started)
            .field("done", &self.grant.is_none())
            .finish()
    }
}

impl<K: StackKey> Future for StackAcquire<K> {
    type Output = StackHold<K>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(grant) = self.grant.as_ref() else {
            panic!("StackAcquire polled after completion");
        };
        if grant.poll_granted(context).is_pending() {
            return Poll::Pending;
        }
        self.grant = None;
        Poll::Ready(StackHold {
            core: Arc::clone(&self.core),
            released: false,
        })
    }
}

impl<K: StackKey> Drop for StackAcquire<K> {
    fn drop(&mut self) {
        if self.grant.take().is_some() {
            wake_all(self.core.abandon(self.run));
        }
    }
}

/// One member's hold of a [`KeyedStack`] run.
#[must_use = "hold will be immediately released if not kept"]
pub struct StackHold<K: StackKey> {
    core: Arc<StackCore<K>>,
    released: bool,
}

impl<K: StackKey> fmt::Debug for StackHold<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackHold")
            .field("released", &self.released)
            .finish()
    }
}

impl<K: StackKey> Guard for StackHold<K> {
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!("stack hold released twice");
            return Err(LockError::misuse("StackHold"));
        }
        self.released = true;
        wake_all(self.core.leave()?);
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl<K: StackKey> Drop for StackHold<K> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Ok(wakers) = self.core.leave() {
                wake_all(wakers);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, poll_once};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn same_key_run_shares_one_gate_hold() {
        init_test("same_key_run_shares_one_gate_hold");
        let stack = KeyedStack::new();
        let holds: Vec<_> = (0..3)
            .map(|_| poll_once(&mut stack.acquire("a")).expect("same run granted"))
            .collect();
        crate::assert_with_log!(stack.gate().grants() == 1, "one gate grant", 1, stack.gate().grants());
        crate::assert_with_log!(stack.gate().holders() == 1, "one holder", 1, stack.gate().holders());
        crate::assert_with_log!(stack.pending() == 3, "three members", 3, stack.pending());

        let mut other = stack.acquire("b");
        let waits = poll_once(&mut other).is_none();
        crate::assert_with_log!(waits, "other key waits", true, waits);

        let mut holds = holds.into_iter();
        for _ in 0..2 {
            drop(holds.next());
            let still = poll_once(&mut other).is_none();
            crate::assert_with_log!(still, "waits while run drains", true, still);
        }
        drop(holds.next());
        let _b = poll_once(&mut other).expect("b granted after run drained");
        crate::assert_with_log!(stack.gate().grants() == 2, "second gate grant", 2, stack.gate().grants());
        crate::test_complete!("same_key_run_shares_one_gate_hold");
    }

    #[test]
    fn different_key_cannot_jump_a_draining_run() {
        init_test("different_key_cannot_jump_a_draining_run");
        let stack = KeyedStack::new();
        let a1 = poll_once(&mut stack.acquire(1)).expect("a1");
        let mut b = stack.acquire(2);
        // Same key as the live run, but the newest run is now `2`.
        let mut a2 = stack.acquire(1);
        crate::assert_with_log!(stack.runs() == 3, "three runs", 3, stack.runs());
        drop(a1);
        let b_hold = poll_once(&mut b).expect("b next");
        let a2_waits = poll_once(&mut a2).is_none();
        crate::assert_with_log!(a2_waits, "a2 queued behind b", true, a2_waits);
        drop(b_hold);
        let _a2 = poll_once(&mut a2).expect("a2 last");
        crate::test_complete!("different_key_cannot_jump_a_draining_run");
    }

    #[test]
    fn queued_run_members_all_wake_together() {
        init_test("queued_run_members_all_wake_together");
        let stack = KeyedStack::new();
        let head = poll_once(&mut stack.acquire("x")).expect("head");
        let mut y1 = stack.acquire("y");
        let mut y2 = stack.acquire("y");
        crate::assert_with_log!(y1.started_run(), "y1 started", true, y1.started_run());
        crate::assert_with_log!(!y2.started_run(), "y2 joined", false, y2.started_run());
        crate::assert_with_log!(stack.gate().waiters() == 1, "single gate waiter", 1, stack.gate().waiters());
        drop(head);
        let both = (poll_once(&mut y1).is_some(), poll_once(&mut y2).is_some());
        crate::assert_with_log!(both == (true, true), "run granted", (true, true), both);
        crate::test_complete!("queued_run_members_all_wake_together");
    }

    #[test]
    fn idle_stack_clears_current_key() {
        init_test("idle_stack_clears_current_key");
        let stack = KeyedStack::new();
        let mut hold = poll_once(&mut stack.acquire("k")).expect("hold");
        crate::assert_with_log!(
            stack.current_key() == Some("k"),
            "current key",
            Some("k"),
            stack.current_key()
        );
        hold.release().expect("release");
        crate::assert_with_log!(stack.current_key().is_none(), "cleared", None::<&str>, stack.current_key());
        let fresh = poll_once(&mut stack.acquire("other"));
        crate::assert_with_log!(fresh.is_some(), "fresh key immediate", true, fresh.is_some());
        crate::test_complete!("idle_stack_clears_current_key");
    }

    #[test]
    fn extra_release_is_misuse() {
        init_test("extra_release_is_misuse");
        let stack: KeyedStack<&str> = KeyedStack::new();
        let raw = stack.release();
        crate::assert_with_log!(
            raw.as_ref().is_err_and(LockError::is_misuse),
            "idle release",
            "Misuse",
            raw
        );
        let mut hold = poll_once(&mut stack.acquire("k")).expect("hold");
        hold.release().expect("first");
        let second = hold.release();
        crate::assert_with_log!(
            second.as_ref().is_err_and(LockError::is_misuse),
            "second release",
            "Misuse",
            second
        );
        crate::assert_with_log!(!stack.is_locked(), "idle", false, stack.is_locked());
        crate::test_complete!("extra_release_is_misuse");
    }

    #[test]
    fn abandoned_queued_run_is_skipped() {
        init_test("abandoned_queued_run_is_skipped");
        let stack = KeyedStack::new();
        let head = poll_once(&mut stack.acquire('a')).expect("head");
        let ghost = stack.acquire('b');
        let mut tail = stack.acquire('c');
        drop(ghost);
        crate::assert_with_log!(stack.runs() == 3, "ghost kept in line", 3, stack.runs());
        drop(head);
        let _c = poll_once(&mut tail).expect("ghost run retired on the way");
        crate::assert_with_log!(stack.runs() == 1, "only c left", 1, stack.runs());
        crate::assert_with_log!(stack.gate().holders() == 1, "gate held by c", 1, stack.gate().holders());
        crate::test_complete!("abandoned_queued_run_is_skipped");
    }

    #[test]
    fn would_block_tracks_live_run() {
        init_test("would_block_tracks_live_run");
        let stack = KeyedStack::new();
        let idle = stack.would_block(&1);
        crate::assert_with_log!(!idle, "idle", false, idle);
        let _hold = poll_once(&mut stack.acquire(1)).expect("hold");
        let join = stack.would_block(&1);
        let other = stack.would_block(&2);
        crate::assert_with_log!(!join, "joining live run is immediate", false, join);
        crate::assert_with_log!(other, "other key waits", true, other);
        crate::test_complete!("would_block_tracks_live_run");
    }
}
