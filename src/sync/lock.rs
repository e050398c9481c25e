//! The contract shared by every lock-like primitive.

use std::future::Future;
use std::sync::Arc;

use crate::error::LockError;

/// A release handle for one granted acquisition.
///
/// Dropping an unreleased guard releases it. Releasing explicitly lets the
/// caller observe misuse: a second `release` returns [`LockError::Misuse`]
/// instead of corrupting the lock's counters.
pub trait Guard: Send + 'static {
    /// Releases the acquisition this guard represents.
    fn release(&mut self) -> Result<(), LockError>;

    /// Returns true once the guard has been released.
    fn is_released(&self) -> bool;
}

/// Uniform acquire / scoped-use surface of the lock primitives.
pub trait Lock {
    /// Handle returned for each granted acquisition.
    type Guard: Guard;

    /// Registers an acquisition now and returns a future resolving once it
    /// is granted.
    fn acquire(&self) -> impl Future<Output = Self::Guard> + Send + 'static;

    /// Returns true if an immediate `acquire()` would have to wait.
    fn is_locked(&self) -> bool;

    /// Runs `critical_section` while holding the lock.
    ///
    /// The guard is released on every exit path, including a panic unwinding
    /// through the critical section; the section's output (an `Err` included)
    /// is returned unchanged.
    fn scoped<F, Fut>(&self, critical_section: F) -> impl Future<Output = Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let acquire = self.acquire();
        async move {
            let guard = acquire.await;
            let output = critical_section().await;
            drop(guard);
            output
        }
    }
}

impl<L: Lock + ?Sized> Lock for &L {
    type Guard = L::Guard;

    fn acquire(&self) -> impl Future<Output = Self::Guard> + Send + 'static {
        (**self).acquire()
    }

    fn is_locked(&self) -> bool {
        (**self).is_locked()
    }
}

impl<L: Lock + ?Sized> Lock for Arc<L> {
    type Guard = L::Guard;

    fn acquire(&self) -> impl Future<Output = Self::Guard> + Send + 'static {
        (**self).acquire()
    }

    fn is_locked(&self) -> bool {
        (**self).is_locked()
    }
}
