// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Half-open time ranges and coverage sets.
//!
//! All times are epoch milliseconds. A [`TimeRange`] is `[start, end)`.
//! An [`IntervalSet`] keeps its ranges sorted, disjoint and non-adjacent:
//! inserting a range that touches or overlaps existing ones merges them.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HOUR_MILLIS: i64 = 3_600_000;
pub const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[must_use]
    pub fn len_millis(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    #[must_use]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping part of two ranges, `None` when they don't overlap.
    #[must_use]
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let r = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        (!r.is_empty()).then_some(r)
    }

    /// Split into consecutive pieces no longer than `max_span`.
    ///
    /// Split points are aligned to multiples of `max_span` since the epoch,
    /// so the same stretch of time always yields the same pieces no matter
    /// where the enclosing range starts.
    #[must_use]
    pub fn split_aligned(&self, max_span: i64) -> Vec<TimeRange> {
        if self.is_empty() {
            return Vec::new();
        }
        if max_span <= 0 {
            return vec![*self];
        }
        let mut pieces = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let boundary = (cursor.div_euclid(max_span) + 1) * max_span;
            let end = boundary.min(self.end);
            pieces.push(TimeRange::new(cursor, end));
            cursor = end;
        }
        pieces
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TimeRange>", into = "Vec<TimeRange>")]
pub struct IntervalSet {
    ranges: Vec<TimeRange>,
}

// Deserializing goes through `insert` so persisted sets are re-normalized.
impl From<Vec<TimeRange>> for IntervalSet {
    fn from(ranges: Vec<TimeRange>) -> Self {
        Self::from_ranges(ranges)
    }
}

impl From<IntervalSet> for Vec<TimeRange> {
    fn from(set: IntervalSet) -> Self {
        set.ranges
    }
}

impl IntervalSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = TimeRange>) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(r);
        }
        set
    }

    #[must_use]
    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn total_millis(&self) -> i64 {
        self.ranges.iter().map(TimeRange::len_millis).sum()
    }

    /// Add a range, merging with anything it overlaps or touches.
    ///
    /// Returns `true` if coverage grew. Coverage never shrinks.
    pub fn insert(&mut self, range: TimeRange) -> bool {
        if range.is_empty() {
            return false;
        }
        let before = self.total_millis();
        let mut merged = range;
        let mut placed = false;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);

        for r in self.ranges.drain(..) {
            if r.end < merged.start {
                out.push(r);
            } else if r.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(r);
            } else {
                merged = TimeRange::new(merged.start.min(r.start), merged.end.max(r.end));
            }
        }
        if !placed {
            out.push(merged);
        }

        self.ranges = out;
        self.total_millis() > before
    }

    /// True when `range` lies entirely inside one covered interval.
    #[must_use]
    pub fn covers(&self, range: &TimeRange) -> bool {
        range.is_empty()
            || self
                .ranges
                .iter()
                .any(|r| r.start <= range.start && r.end >= range.end)
    }

    /// Parts of `range` not covered by this set, in ascending order.
    #[must_use]
    pub fn difference(&self, range: &TimeRange) -> Vec<TimeRange> {
        let mut gaps = Vec::new();
        if range.is_empty() {
            return gaps;
        }
        let mut cursor = range.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= range.end {
                break;
            }
            if r.start > cursor {
                gaps.push(TimeRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            gaps.push(TimeRange::new(cursor, range.end));
        }
        gaps
    }

    /// Covered parts of `range`, in ascending order.
    #[must_use]
    pub fn intersection(&self, range: &TimeRange) -> Vec<TimeRange> {
        self.ranges
            .iter()
            .filter_map(|r| r.intersect(range))
            .collect()
    }
}

/// Merge neighbouring ranges separated by less than `min_gap` milliseconds.
///
/// Input must be sorted and disjoint. The stretch between two merged ranges
/// is absorbed, so the output may cover time the input did not.
#[must_use]
pub fn coalesce(ranges: &[TimeRange], min_gap: i64) -> Vec<TimeRange> {
    let mut out: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for r in ranges.iter().copied().filter(|r| !r.is_empty()) {
        match out.last_mut() {
            Some(last) if r.start - last.end < min_gap => last.end = last.end.max(r.end),
            _ => out.push(r),
        }
    }
    out
}
