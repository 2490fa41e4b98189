//! Position of an event inside one trace file.
//!
//! An [`EventIndex`] is `(timestamp, differentiator)`, ordered by timestamp
//! first and differentiator second. The differentiator only disambiguates
//! events that share a timestamp *within the same trace file*; comparing
//! indices taken from different files is meaningless and callers must not
//! rely on it.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Total-order key over the events of one trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventIndex {
    /// Logical event time (the decoder's raw timestamp).
    pub timestamp: i64,
    /// Position among the events of this file that share `timestamp`.
    pub differentiator: i32,
}

impl EventIndex {
    /// Sentinel below every index an [`EventIndexer`] hands out.
    ///
    /// Consumers return it from `max_index_already_processed` when they have
    /// seen nothing from a file yet.
    pub const BEGINNING: EventIndex = EventIndex {
        timestamp: i64::MIN,
        differentiator: i32::MIN,
    };

    pub const fn new(timestamp: i64, differentiator: i32) -> Self {
        Self {
            timestamp,
            differentiator,
        }
    }

    /// Overwrites both components.
    pub fn set(&mut self, timestamp: i64, differentiator: i32) {
        self.timestamp = timestamp;
        self.differentiator = differentiator;
    }

    /// Three-way comparison, `-1`, `0` or `1`.
    pub fn compare_to(&self, other: &EventIndex) -> i32 {
        match self.cmp(other) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }
}

impl Default for EventIndex {
    fn default() -> Self {
        Self::BEGINNING
    }
}

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.timestamp, self.differentiator)
    }
}

/// Error parsing an [`EventIndex`] from its `"<timestamp>_<differentiator>"` form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid event index {input:?}: expected <timestamp>_<differentiator>")]
pub struct ParseEventIndexError {
    input: String,
}

impl FromStr for EventIndex {
    type Err = ParseEventIndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEventIndexError { input: s.to_string() };
        // Timestamps may be negative, so split on the last underscore.
        let (ts, diff) = s.rsplit_once('_').ok_or_else(err)?;
        let timestamp = ts.parse().map_err(|_| err())?;
        let differentiator = diff.parse().map_err(|_| err())?;
        Ok(Self::new(timestamp, differentiator))
    }
}

/// Assigns indices to the successive events of one trace file.
///
/// The first event at a timestamp gets differentiator 0, each following event
/// with the same timestamp gets the next value. A timestamp lower than the
/// previous one (clock adjustments in the source) keeps the previous
/// timestamp and bumps the differentiator. Once the differentiator reaches
/// `i32::MAX` the next index carries into the timestamp, so the indices
/// handed out are strictly increasing in every case.
#[derive(Debug, Clone, Default)]
pub struct EventIndexer {
    last: Option<EventIndex>,
}

impl EventIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index for the next event of the file.
    pub fn next_index(&mut self, timestamp: i64) -> EventIndex {
        let next = match self.last {
            Some(last) if timestamp <= last.timestamp => match last.differentiator.checked_add(1) {
                Some(differentiator) => EventIndex::new(last.timestamp, differentiator),
                // Differentiators exhausted: carry into the timestamp.
                None => EventIndex::new(last.timestamp.saturating_add(1), 0),
            },
            _ => EventIndex::new(timestamp, 0),
        };
        debug_assert!(self.last.map_or(true, |last| last < next));
        self.last = Some(next);
        next
    }

    /// The index most recently handed out.
    pub fn last(&self) -> Option<EventIndex> {
        self.last
    }
}
