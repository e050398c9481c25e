//! Per-key locks created on demand.
//!
//! [`KeyedLocks`] maps each key to its own [`CountingGate`]. Gates are
//! created the first time a key is locked and pruned once the last holder
//! of an idle key releases, so the map only holds keys that are in use.
//!
//! ```
//! use lanesync::KeyedLocks;
//!
//! let locks = KeyedLocks::new();
//! futures_lite::future::block_on(async {
//!     let a = locks.lock("account-1").await;
//!     // Other keys are unaffected.
//!     let _b = locks.lock("account-2").await;
//!     assert!(locks.is_locked(&"account-1"));
//!     drop(a);
//!     assert!(!locks.is_locked(&"account-1"));
//! });
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use crate::config::Capacity;
use crate::error::LockError;
use crate::sync::gate::{CountingGate, GatePermit};
use crate::sync::lock::Guard;

type GateMap<K> = Arc<Mutex<HashMap<K, CountingGate>>>;

/// A lazily populated set of gates, one per key.
pub struct KeyedLocks<K> {
    capacity: Capacity,
    gates: GateMap<K>,
}

impl<K> fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("capacity", &self.capacity)
            .field("keys", &self.gates.lock().len())
            .finish()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// A mutex per key.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Capacity::ONE)
    }

    /// Gates admitting `capacity` holders per key.
    #[must_use]
    pub fn with_capacity(capacity: Capacity) -> Self {
        Self {
            capacity,
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Per-key capacity.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Registers an acquisition of `key`'s gate.
    pub fn lock(&self, key: K) -> impl Future<Output = KeyedGuard<K>> + Send + 'static {
        let acquire = self
            .gates
            .lock()
            .entry(key.clone())
            .or_insert_with(|| CountingGate::new(self.capacity))
            .acquire();
        let gates = Arc::clone(&self.gates);
        async move {
            let permit = acquire.await;
            KeyedGuard {
                gates,
                key,
                permit,
                released: false,
            }
        }
    }

    /// Runs `critical_section` while holding `key`.
    pub fn scoped<F, Fut>(&self, key: K, critical_section: F) -> impl Future<Output = Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let lock = self.lock(key);
        async move {
            let guard = lock.await;
            let output = critical_section().await;
            drop(guard);
            output
        }
    }

    /// Returns true if locking `key` now would wait.
    #[must_use]
    pub fn is_locked(&self, key: &K) -> bool {
        self.gates.lock().get(key).is_some_and(CountingGate::is_locked)
    }

    /// Number of keys with a live gate.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.lock().len()
    }

    /// Returns true if no key has a live gate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.lock().is_empty()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A held key of a [`KeyedLocks`].
#[must_use = "key lock will be immediately released if not held"]
pub struct KeyedGuard<K: Eq + Hash> {
    gates: GateMap<K>,
    key: K,
    permit: GatePermit,
    released: bool,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    /// The held key.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl<K: Eq + Hash> KeyedGuard<K> {
    /// Drops the key's gate if nobody holds or waits on it.
    fn prune(&self) {
        let mut gates = self.gates.lock();
        let idle = gates
            .get(&self.key)
            .is_some_and(|gate| gate.holders() == 0 && gate.waiters() == 0);
        if idle {
            gates.remove(&self.key);
            tracing::trace!(keys = gates.len(), "idle key gate pruned");
        }
    }
}

impl<K: Eq + Hash + Send + 'static> Guard for KeyedGuard<K> {
    fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            tracing::warn!("keyed lock released twice");
            return Err(LockError::misuse("KeyedGuard"));
        }
        self.released = true;
        self.permit.release()?;
        self.prune();
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if self.permit.release().is_ok() {
                self.prune();
            }
        }
    }
}
