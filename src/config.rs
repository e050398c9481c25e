//! Capacity and lane graph configuration.
//!
//! Configuration values are plain data that can be built in code or
//! deserialized with serde, and are validated up front so that lock
//! construction never has to second-guess them.
//!
//! ```
//! use lanesync::config::{Capacity, LaneSpec};
//!
//! let specs = vec![
//!     LaneSpec::new("read", Vec::<String>::new(), Capacity::Unbounded),
//!     LaneSpec::new("write", ["read"], Capacity::ONE),
//! ];
//! assert!(lanesync::config::validate_lane_specs(&specs).is_ok());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroUsize;

use serde::Deserialize;

use crate::error::ConfigError;

/// How many holders a gate admits at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "CapacityRepr")]
pub enum Capacity {
    /// At most this many concurrent holders.
    Bounded(NonZeroUsize),
    /// Any number of concurrent holders.
    #[default]
    Unbounded,
}

impl Capacity {
    /// Capacity of a mutex.
    pub const ONE: Self = Self::Bounded(NonZeroUsize::MIN);

    /// Builds a finite capacity, rejecting zero.
    pub fn bounded(limit: usize) -> Result<Self, ConfigError> {
        NonZeroUsize::new(limit)
            .map(Self::Bounded)
            .ok_or(ConfigError::InvalidCapacity(0))
    }

    /// Returns the finite limit, or `None` when unbounded.
    #[must_use]
    pub const fn limit(self) -> Option<usize> {
        match self {
            Self::Bounded(limit) => Some(limit.get()),
            Self::Unbounded => None,
        }
    }

    /// Returns true if one more holder fits next to `holders`.
    #[inline]
    #[must_use]
    pub(crate) const fn admits(self, holders: usize) -> bool {
        match self {
            Self::Bounded(limit) => holders < limit.get(),
            Self::Unbounded => true,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(limit) => write!(f, "{limit}"),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

impl TryFrom<i64> for Capacity {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Self::Bounded)
            .ok_or(ConfigError::InvalidCapacity(value))
    }
}

impl std::str::FromStr for Capacity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "unbounded" | "infinite" | "inf" => Ok(Self::Unbounded),
            other => other
                .parse::<i64>()
                .map_err(|_| ConfigError::UnknownCapacity(trimmed.to_string()))
                .and_then(Self::try_from),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CapacityRepr {
    Count(i64),
    Word(String),
}

impl TryFrom<CapacityRepr> for Capacity {
    type Error = ConfigError;

    fn try_from(repr: CapacityRepr) -> Result<Self, Self::Error> {
        match repr {
            CapacityRepr::Count(count) => Self::try_from(count),
            CapacityRepr::Word(word) => word.parse(),
        }
    }
}

/// One lane of a lane graph: its name, the lanes it excludes while held,
/// and its own capacity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaneSpec {
    /// Lane name, unique within a graph.
    pub name: String,
    /// Names of the lanes that may not admit newcomers while this lane is held.
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Concurrent holders admitted by this lane.
    #[serde(default)]
    pub capacity: Capacity,
}

impl LaneSpec {
    /// Creates a lane description.
    pub fn new<I, S>(name: impl Into<String>, blocks: I, capacity: Capacity) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            blocks: blocks.into_iter().map(Into::into).collect(),
            capacity,
        }
    }
}

/// Validates a lane graph description.
///
/// Rejects empty or duplicate names, lanes that block themselves, and
/// blocking cycles. Lanes referenced in `blocks` but not declared are
/// allowed; they become unbounded lanes that block nothing.
pub fn validate_lane_specs(specs: &[LaneSpec]) -> Result<(), ConfigError> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for spec in specs {
        if spec.name.is_empty() || spec.blocks.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyLaneName);
        }
        if spec.blocks.iter().any(|blocked| *blocked == spec.name) {
            return Err(ConfigError::SelfBlocking(spec.name.clone()));
        }
        let blocked = spec.blocks.iter().map(String::as_str).collect();
        if edges.insert(spec.name.as_str(), blocked).is_some() {
            return Err(ConfigError::DuplicateLane(spec.name.clone()));
        }
    }

    let mut finished = BTreeSet::new();
    for spec in specs {
        let mut path = Vec::new();
        find_cycle(spec.name.as_str(), &edges, &mut path, &mut finished)?;
    }
    Ok(())
}

fn find_cycle<'a>(
    lane: &'a str,
    edges: &BTreeMap<&'a str, Vec<&'a str>>,
    path: &mut Vec<&'a str>,
    finished: &mut BTreeSet<&'a str>,
) -> Result<(), ConfigError> {
    if finished.contains(lane) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|seen| *seen == lane) {
        let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
        cycle.push(lane.to_string());
        return Err(ConfigError::BlockingCycle(cycle));
    }
    path.push(lane);
    for blocked in edges.get(lane).into_iter().flatten() {
        find_cycle(*blocked, edges, path, finished)?;
    }
    path.pop();
    finished.insert(lane);
    Ok(())
}
