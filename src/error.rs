//! Error types for the lock primitives.
//!
//! Two things can go wrong, and both are reported as typed errors to the
//! immediate caller:
//!
//! - **Misuse**: a release handle (or a raw `release()`) was used more times
//!   than acquisitions were granted.
//! - **Configuration**: a capacity or lane graph description is invalid.
//!
//! A wait that never completes because capacity is never freed is not an
//! error; it is a deadlock owned by the caller.

use thiserror::Error;

/// Error returned by lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// A release was issued without a matching outstanding grant.
    #[error("{primitive} released more times than it was acquired")]
    Misuse {
        /// The primitive that detected the extra release.
        primitive: &'static str,
    },
    /// Construction was given an invalid configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl LockError {
    pub(crate) const fn misuse(primitive: &'static str) -> Self {
        Self::Misuse { primitive }
    }

    /// Returns true if this is a release-misuse error.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse { .. })
    }
}

/// Error returned when a capacity or lane graph description is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A finite capacity must be at least one.
    #[error("capacity must be a positive integer, got {0}")]
    InvalidCapacity(i64),
    /// A textual capacity other than `unbounded`.
    #[error("unrecognised capacity `{0}` (expected a positive integer or \"unbounded\")")]
    UnknownCapacity(String),
    /// Lane names must be non-empty.
    #[error("lane name must not be empty")]
    EmptyLaneName,
    /// The same lane was declared twice.
    #[error("lane `{0}` is declared more than once")]
    DuplicateLane(String),
    /// A lane lists itself among the lanes it blocks.
    #[error("lane `{0}` cannot block itself")]
    SelfBlocking(String),
    /// Lanes that (transitively) block each other can deadlock on acquire.
    #[error("lanes block each other in a cycle: {}", .0.join(" -> "))]
    BlockingCycle(Vec<String>),
}
