//! Wrap an async operation so every call runs under a lock chosen from its
//! argument.
//!
//! ```
//! use lanesync::{LaneGraph, guarded};
//!
//! let graph = LaneGraph::new();
//! let upload = guarded(
//!     |bucket: &String| graph.lane(bucket),
//!     |bucket: String| async move { format!("stored in {bucket}") },
//! );
//! let out = futures_lite::future::block_on(upload.call("photos".to_string()));
//! assert_eq!(out, "stored in photos");
//! ```

use std::future::Future;

use crate::sync::lock::Lock;

/// Returns a wrapper that, on each [`call`](Guarded::call), resolves a lock
/// from the argument with `resolver` and runs `operation` while holding it.
pub fn guarded<R, F>(resolver: R, operation: F) -> Guarded<R, F> {
    Guarded {
        resolver,
        operation,
    }
}

/// An operation bound to a lock resolver. Built by [`guarded`].
#[derive(Debug, Clone)]
pub struct Guarded<R, F> {
    resolver: R,
    operation: F,
}

impl<R, F> Guarded<R, F> {
    /// Runs the operation on `arg` under the lock resolved for it.
    ///
    /// The lock is released whether the operation returns normally, returns
    /// an error, or panics; its output is returned unchanged.
    pub async fn call<A, L, Fut>(&self, arg: A) -> Fut::Output
    where
        R: Fn(&A) -> L,
        L: Lock,
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        let lock = (self.resolver)(&arg);
        lock.scoped(|| (self.operation)(arg)).await
    }
}
