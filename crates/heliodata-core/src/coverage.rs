//! Per-dataset coverage bookkeeping.

use crate::interval::{TimeInterval, gap_subtract, merge_adjacent};

/// The set of time ranges of one dataset that are present in a cache.
///
/// Intervals are kept sorted, disjoint and non-adjacent: inserting `[0, 10)`
/// next to `[10, 20)` leaves a single `[0, 20)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoverageIndex {
    intervals: Vec<TimeInterval>,
}

impl CoverageIndex {
    /// Creates an empty index.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    /// Builds a minimal index from arbitrary, possibly overlapping intervals.
    #[must_use]
    pub fn from_intervals(intervals: impl IntoIterator<Item = TimeInterval>) -> Self {
        Self {
            intervals: merge_adjacent(intervals),
        }
    }

    /// Adds an interval, coalescing it with its neighbours.
    pub fn insert(&mut self, interval: TimeInterval) {
        let mut intervals = std::mem::take(&mut self.intervals);
        intervals.push(interval);
        self.intervals = merge_adjacent(intervals);
    }

    /// The covered intervals, sorted.
    #[must_use]
    pub fn intervals(&self) -> &[TimeInterval] {
        &self.intervals
    }

    /// Returns true if nothing is covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Returns true if `interval` is entirely covered.
    #[must_use]
    pub fn covers(&self, interval: &TimeInterval) -> bool {
        self.intervals
            .iter()
            .any(|covered| covered.contains_interval(interval))
    }

    /// The parts of `requested` that are not covered.
    #[must_use]
    pub fn missing(&self, requested: &TimeInterval) -> Vec<TimeInterval> {
        gap_subtract(requested, &self.intervals)
    }

    /// The parts of `requested` that are covered.
    #[must_use]
    pub fn present(&self, requested: &TimeInterval) -> Vec<TimeInterval> {
        self.intervals
            .iter()
            .filter_map(|covered| covered.intersection(requested))
            .collect()
    }
}
