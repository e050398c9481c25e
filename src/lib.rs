//! Fair, layered asynchronous exclusion for cooperative tasks.
//!
//! `lanesync` composes a small set of async lock primitives into named
//! exclusion *lanes* that can block one another ("writers block readers")
//! without letting either side starve.
//!
//! # Layers
//!
//! - [`CountingGate`]: FIFO counting semaphore with direct hand-off.
//! - [`KeyedStack`]: collapses consecutive same-key acquisitions into one
//!   hold of a capacity-1 gate.
//! - [`PhaseGate`]: generations of gates behind a keyed turnstile; a blocker
//!   opens a new generation that only admits once older ones drain.
//! - [`Lane`] / [`LaneGraph`]: named phase gates that lock their blocked
//!   siblings while held.
//! - [`ReadWriteLock`]: a lane graph with `read` and `write` lanes.
//!
//! Every acquisition is registered when `acquire()` is *called*; the returned
//! future only waits for the grant. Arrival order is therefore call order,
//! not first-poll order.
//!
//! # Example
//!
//! ```
//! use lanesync::{Lock, ReadWriteLock};
//!
//! let rw = ReadWriteLock::new();
//! let value = futures_lite::future::block_on(rw.write().scoped(|| async { 42 }));
//! assert_eq!(value, 42);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
pub(crate) use test_utils::{assert_with_log, test_complete, test_phase};

pub use config::{Capacity, LaneSpec};
pub use error::{ConfigError, LockError};
pub use sync::{
    CountingGate, GateAcquire, GatePermit, Guard, Guarded, KeyedGuard, KeyedLocks, KeyedStack,
    Lane, LaneGraph, LaneGuard, Lock, PhaseGate, PhaseLock, PhasePermit, ReadWriteLock,
    StackAcquire, StackHold, guarded,
};
