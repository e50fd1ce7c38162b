//! Half-open time intervals and the gap arithmetic built on them.
//!
//! Every interval is `[start, end)`: an interval ending at `t` and another
//! starting at `t` are adjacent, not overlapping. The free functions
//! [`gap_subtract`] and [`merge_adjacent`] are what the request planner and the
//! coverage index use to decide what must be fetched.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::error::{DataError, Result};

/// A half-open `[start, end)` range of UTC instants with `start < end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeInterval {
    /// Creates a new interval.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidInterval`] unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(DataError::InvalidInterval {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Creates an interval from whole UNIX seconds.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidInterval`] if either bound is out of range
    /// or `start >= end`.
    pub fn from_unix_seconds(start: i64, end: i64) -> Result<Self> {
        let invalid = || DataError::InvalidInterval {
            start: start.to_string(),
            end: end.to_string(),
        };
        let start = DateTime::from_timestamp(start, 0).ok_or_else(invalid)?;
        let end = DateTime::from_timestamp(end, 0).ok_or_else(invalid)?;
        Self::new(start, end)
    }

    /// Inclusive lower bound.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive upper bound.
    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Length of the interval.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Returns true if `instant` lies in `[start, end)`.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns true if `other` lies entirely inside `self`.
    #[must_use]
    pub fn contains_interval(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns true if the two intervals share at least one instant.
    ///
    /// Intervals that merely touch at a boundary do not intersect.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if one interval ends exactly where the other starts.
    #[must_use]
    pub fn is_adjacent(&self, other: &Self) -> bool {
        self.end == other.start || other.end == self.start
    }

    /// The common part of both intervals, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Self { start, end })
    }

    /// The smallest interval spanning both, when they overlap or touch.
    #[must_use]
    pub fn union(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) && !self.is_adjacent(other) {
            return None;
        }
        Some(Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        })
    }

    /// Removes `other` from `self`, leaving zero, one or two intervals.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Vec<Self> {
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if self.start < other.start {
            rest.push(Self {
                start: self.start,
                end: other.start,
            });
        }
        if other.end < self.end {
            rest.push(Self {
                start: other.end,
                end: self.end,
            });
        }
        rest
    }

    /// Cuts the interval at every multiple of `step` since the UNIX epoch.
    ///
    /// A one-day interval split on a 12 hour step starting at 06:00 yields
    /// `[06:00, 12:00)`, `[12:00, 00:00)` and `[00:00, 06:00)`.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidParameter`] if `step` is not positive or a
    /// bound cannot be expressed in nanoseconds.
    pub fn split_aligned(&self, step: TimeDelta) -> Result<Vec<Self>> {
        let step_ns = step
            .num_nanoseconds()
            .filter(|ns| *ns > 0)
            .ok_or_else(|| DataError::InvalidParameter(format!("invalid split step {step}")))?;
        let out_of_range =
            || DataError::InvalidParameter(format!("{self} is out of nanosecond range"));
        let start_ns = self.start.timestamp_nanos_opt().ok_or_else(out_of_range)?;
        let end_ns = self.end.timestamp_nanos_opt().ok_or_else(out_of_range)?;

        let mut pieces = Vec::new();
        let mut lower = self.start;
        let mut cut = start_ns
            .div_euclid(step_ns)
            .checked_mul(step_ns)
            .and_then(|floor| floor.checked_add(step_ns));
        while let Some(boundary) = cut.filter(|b| *b < end_ns) {
            let upper = DateTime::from_timestamp_nanos(boundary);
            pieces.push(Self {
                start: lower,
                end: upper,
            });
            lower = upper;
            cut = boundary.checked_add(step_ns);
        }
        pieces.push(Self {
            start: lower,
            end: self.end,
        });
        Ok(pieces)
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
}

/// Returns the parts of `requested` not covered by any interval in `covered`.
///
/// `covered` does not need to be sorted or disjoint. The result is sorted and
/// its intervals are disjoint and non-adjacent.
#[must_use]
pub fn gap_subtract(requested: &TimeInterval, covered: &[TimeInterval]) -> Vec<TimeInterval> {
    let mut gaps = Vec::new();
    let mut cursor = requested.start;

    for block in merge_adjacent(covered.iter().copied()) {
        if block.end <= cursor {
            continue;
        }
        if block.start >= requested.end {
            break;
        }
        if block.start > cursor {
            gaps.push(TimeInterval {
                start: cursor,
                end: block.start,
            });
        }
        cursor = cursor.max(block.end);
        if cursor >= requested.end {
            return gaps;
        }
    }

    if cursor < requested.end {
        gaps.push(TimeInterval {
            start: cursor,
            end: requested.end,
        });
    }
    gaps
}

/// Coalesces overlapping and touching intervals into a sorted disjoint set.
#[must_use]
pub fn merge_adjacent(intervals: impl IntoIterator<Item = TimeInterval>) -> Vec<TimeInterval> {
    let mut sorted: Vec<TimeInterval> = intervals.into_iter().collect();
    sorted.sort_unstable();

    let mut merged: Vec<TimeInterval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: i64, end: i64) -> TimeInterval {
        TimeInterval::from_unix_seconds(start, end).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_and_reversed() {
        assert!(matches!(
            TimeInterval::from_unix_seconds(10, 10),
            Err(DataError::InvalidInterval { .. })
        ));
        assert!(matches!(
            TimeInterval::from_unix_seconds(20, 10),
            Err(DataError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_half_open_semantics() {
        let a = iv(0, 10);
        let b = iv(10, 20);
        assert!(!a.intersects(&b));
        assert!(a.is_adjacent(&b));
        assert!(a.contains(a.start()));
        assert!(!a.contains(a.end()));
        assert_eq!(a.union(&b), Some(iv(0, 20)));
        assert_eq!(a.intersection(&b), None);
        assert_eq!(iv(0, 10).union(&iv(11, 20)), None);
    }

    #[test]
    fn test_subtract_cases() {
        let base = iv(0, 100);
        assert_eq!(base.subtract(&iv(200, 300)), vec![base]);
        assert_eq!(base.subtract(&iv(0, 100)), vec![]);
        assert_eq!(base.subtract(&iv(0, 40)), vec![iv(40, 100)]);
        assert_eq!(base.subtract(&iv(60, 150)), vec![iv(0, 60)]);
        assert_eq!(base.subtract(&iv(20, 30)), vec![iv(0, 20), iv(30, 100)]);
    }

    #[test]
    fn test_gap_subtract_no_coverage() {
        assert_eq!(gap_subtract(&iv(0, 100), &[]), vec![iv(0, 100)]);
    }

    #[test]
    fn test_gap_subtract_full_coverage() {
        assert!(gap_subtract(&iv(10, 20), &[iv(0, 50)]).is_empty());
        assert!(gap_subtract(&iv(10, 20), &[iv(10, 20)]).is_empty());
        assert!(gap_subtract(&iv(0, 20), &[iv(0, 10), iv(10, 20)]).is_empty());
    }

    #[test]
    fn test_gap_subtract_partial_coverage() {
        assert_eq!(gap_subtract(&iv(0, 100), &[iv(0, 40)]), vec![iv(40, 100)]);
        assert_eq!(
            gap_subtract(&iv(0, 100), &[iv(10, 20), iv(50, 60)]),
            vec![iv(0, 10), iv(20, 50), iv(60, 100)]
        );
        assert_eq!(
            gap_subtract(&iv(30, 70), &[iv(0, 40), iv(60, 100)]),
            vec![iv(40, 60)]
        );
    }

    #[test]
    fn test_gap_subtract_touching_boundaries() {
        assert_eq!(
            gap_subtract(&iv(10, 20), &[iv(0, 10), iv(20, 30)]),
            vec![iv(10, 20)]
        );
    }

    #[test]
    fn test_gap_subtract_unsorted_input() {
        assert_eq!(
            gap_subtract(&iv(0, 100), &[iv(50, 60), iv(10, 20), iv(15, 30)]),
            vec![iv(0, 10), iv(30, 50), iv(60, 100)]
        );
    }

    #[test]
    fn test_merge_adjacent() {
        assert_eq!(
            merge_adjacent([iv(20, 30), iv(0, 10), iv(10, 15), iv(25, 40), iv(50, 60)]),
            vec![iv(0, 15), iv(20, 40), iv(50, 60)]
        );
        assert!(merge_adjacent(Vec::new()).is_empty());
    }

    #[test]
    fn test_split_aligned() {
        let day = TimeDelta::hours(12);
        // 06:00 on day 0 to 06:00 on day 1
        let interval = iv(6 * 3600, 30 * 3600);
        let pieces = interval.split_aligned(day).unwrap();
        assert_eq!(
            pieces,
            vec![
                iv(6 * 3600, 12 * 3600),
                iv(12 * 3600, 24 * 3600),
                iv(24 * 3600, 30 * 3600)
            ]
        );
    }

    #[test]
    fn test_split_aligned_within_one_step() {
        let interval = iv(100, 200);
        assert_eq!(
            interval.split_aligned(TimeDelta::hours(1)).unwrap(),
            vec![interval]
        );
        assert!(interval.split_aligned(TimeDelta::zero()).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            iv(0, 60).to_string(),
            "[1970-01-01T00:00:00Z, 1970-01-01T00:01:00Z)"
        );
    }
}
