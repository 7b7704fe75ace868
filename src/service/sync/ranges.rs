// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Ranges Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Index windows over a sorted room list. Client supplied ranges are
//   validated, normalized into ascending disjoint sets and clamped to the
//   list's current count before any op is generated from them.
//
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ranges exactly as they appear on the wire: inclusive `[low, high]` pairs.
pub type SliceRanges = Vec<[i64; 2]>;

/// An inclusive index interval. Serializes as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range(pub usize, pub usize);

impl Range {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "range start {start} > end {end}");
        Self(start, end)
    }

    pub fn start(&self) -> usize {
        self.0
    }

    pub fn end(&self) -> usize {
        self.1
    }

    pub fn len(&self) -> usize {
        self.1 - self.0 + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0 <= index && index <= self.1
    }

    /// Clamp to a list of `count` rooms. `None` when nothing is left.
    pub fn clamp(&self, count: usize) -> Option<Range> {
        if count == 0 || self.0 >= count {
            return None;
        }
        Some(Range(self.0, self.1.min(count - 1)))
    }

    fn intersect(&self, other: &Range) -> Option<Range> {
        let start = self.0.max(other.0);
        let end = self.1.min(other.1);
        (start <= end).then_some(Range(start, end))
    }
}

/// Canonical set of ranges: ascending, non-overlapping.
///
/// Overlapping ranges are merged but adjacent ones are kept apart, so a
/// client asking for `[0,2]` and `[3,5]` gets one SYNC per range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet(Vec<Range>);

impl RangeSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Every index of a list with `count` rooms.
    pub fn all(count: usize) -> Self {
        match count {
            0 => Self::empty(),
            n => Self(vec![Range(0, n - 1)]),
        }
    }

    pub fn from_ranges(mut ranges: Vec<Range>) -> Self {
        ranges.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.0 <= last.1 => last.1 = last.1.max(range.1),
                _ => merged.push(range),
            }
        }
        Self(merged)
    }

    /// Validate wire ranges. Rejects negative indices and `low > high`.
    pub fn parse(raw: &[[i64; 2]]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(raw.len());
        for [low, high] in raw {
            if *low < 0 || *high < 0 {
                return Err(Error::BadRequest(format!(
                    "range [{low}, {high}] has a negative index"
                )));
            }
            if low > high {
                return Err(Error::BadRequest(format!(
                    "range [{low}, {high}] has low > high"
                )));
            }
            ranges.push(Range(*low as usize, *high as usize));
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn clamp(&self, count: usize) -> Self {
        Self(self.0.iter().filter_map(|r| r.clamp(count)).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.0
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.iter().any(|r| r.contains(index))
    }

    /// Total number of covered indices.
    pub fn covered(&self) -> usize {
        self.0.iter().map(Range::len).sum()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().flat_map(|r| r.0..=r.1)
    }

    /// Spans of `range` also covered by `self`, ascending.
    pub fn intersect_range(&self, range: &Range) -> Vec<Range> {
        self.0.iter().filter_map(|r| r.intersect(range)).collect()
    }

    /// Spans of `range` not covered by `self`, ascending.
    pub fn uncovered_in(&self, range: &Range) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = range.0;
        for covered in self.intersect_range(range) {
            if covered.0 > cursor {
                gaps.push(Range(cursor, covered.0 - 1));
            }
            cursor = covered.1 + 1;
        }
        if cursor <= range.1 {
            gaps.push(Range(cursor, range.1));
        }
        gaps
    }

    /// Spans of `self` not covered by `other`, ascending.
    pub fn subtract(&self, other: &RangeSet) -> Vec<Range> {
        self.0
            .iter()
            .flat_map(|range| other.uncovered_in(range))
            .collect()
    }
}
