//! Async exclusion primitives, from a plain counting gate up to lane graphs.
//!
//! # Primitives
//!
//! - [`CountingGate`]: FIFO counting semaphore with direct hand-off.
//! - [`KeyedStack`]: one gate hold shared by consecutive same-key arrivals.
//! - [`PhaseGate`]: generations of gates split by blockers.
//! - [`Lane`] / [`LaneGraph`]: named phase gates that block each other.
//! - [`ReadWriteLock`]: the `read` / `write` lane graph.
//! - [`KeyedLocks`]: a gate per key, created on demand.
//!
//! # Acquire / Release Pattern
//!
//! Every primitive follows the same two steps:
//!
//! - **Register**: calling `acquire()` takes a place in line immediately.
//!   The returned future resolves once that place is granted; dropping it
//!   first withdraws the registration.
//! - **Hold**: the granted guard is released explicitly with
//!   [`Guard::release`] or implicitly on drop, including during a panic
//!   unwind. Releasing twice is reported as [`LockError::Misuse`].
//!
//! [`LockError::Misuse`]: crate::LockError::Misuse

mod gate;
mod guarded;
mod keyed_stack;
mod lane;
mod lock;
mod phase;
mod pool;
mod rwlock;

pub use gate::{CountingGate, GateAcquire, GatePermit};
pub use guarded::{Guarded, guarded};
pub use keyed_stack::{KeyedStack, StackAcquire, StackHold, StackKey};
pub use lane::{Lane, LaneGraph, LaneGuard};
pub use lock::{Guard, Lock};
pub use phase::{PhaseGate, PhaseLock, PhasePermit};
pub use pool::{KeyedGuard, KeyedLocks};
pub use rwlock::{READ_LANE, ReadWriteLock, WRITE_LANE};
