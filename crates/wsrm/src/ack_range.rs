// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acknowledgement range sets.
//!
//! An [`AckRangeSet`] records which message numbers of one sequence have been
//! acknowledged, as ascending inclusive `[lower, upper]` ranges. After every
//! mutation the ranges are pairwise disjoint and never adjacent, so the set is
//! always stored in its minimal form:
//!
//! ```text
//! acknowledge 1,2,5,4,6   ->  [1..2] [4..6]
//! acknowledge 3           ->  [1..6]
//! ```

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of acknowledged message numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckRange {
    pub lower: u64,
    pub upper: u64,
}

impl AckRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper, "inverted range {}..{}", lower, upper);
        Self { lower, upper }
    }

    pub fn single(number: u64) -> Self {
        Self::new(number, number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.lower <= number && number <= self.upper
    }

    /// Count of numbers covered. A range always covers at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

impl fmt::Display for AckRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.lower, self.upper)
    }
}

/// Ordered set of disjoint acknowledgement ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckRangeSet {
    ranges: Vec<AckRange>,
}

impl AckRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a normalized set from arbitrary (unsorted, overlapping) ranges.
    pub fn from_ranges<I: IntoIterator<Item = AckRange>>(ranges: I) -> Self {
        let mut set = Self::from_raw_ranges(ranges.into_iter().collect());
        set.merge();
        set
    }

    /// Wrap ranges as given, without normalizing.
    ///
    /// Used for state loaded from a store or received from a peer. Call
    /// [`merge`](Self::merge) before relying on the set invariants.
    pub fn from_raw_ranges(ranges: Vec<AckRange>) -> Self {
        Self { ranges }
    }

    /// Insert `number`. Returns `false` if it was already covered.
    pub fn acknowledge(&mut self, number: u64) -> bool {
        // first range starting above `number`
        let idx = self.ranges.partition_point(|r| r.lower <= number);

        if idx > 0 {
            let prev = &mut self.ranges[idx - 1];
            if number <= prev.upper {
                return false;
            }
            if prev.upper + 1 == number {
                prev.upper = number;
                let bridges = self
                    .ranges
                    .get(idx)
                    .is_some_and(|next| number.checked_add(1) == Some(next.lower));
                if bridges {
                    let next = self.ranges.remove(idx);
                    self.ranges[idx - 1].upper = next.upper;
                }
                return true;
            }
        }

        if let Some(next) = self.ranges.get_mut(idx) {
            if number.checked_add(1) == Some(next.lower) {
                next.lower = number;
                return true;
            }
        }

        self.ranges.insert(idx, AckRange::single(number));
        true
    }

    /// Sort and coalesce overlapping or adjacent ranges.
    pub fn merge(&mut self) {
        if self.ranges.len() < 2 {
            return;
        }
        let before = self.ranges.len();
        self.ranges.sort_unstable_by_key(|r| r.lower);

        let mut merged: Vec<AckRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.upper.saturating_add(1) >= range.lower => {
                    last.upper = last.upper.max(range.upper);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;

        if self.ranges.len() != before {
            log::debug!(
                "[ack-range] merged {} ranges into {}",
                before,
                self.ranges.len()
            );
        }
    }

    pub fn contains(&self, number: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.lower <= number);
        idx > 0 && number <= self.ranges[idx - 1].upper
    }

    /// True if every number in `[lower, upper]` is acknowledged.
    pub fn covers(&self, lower: u64, upper: u64) -> bool {
        if lower > upper {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.lower <= lower);
        idx > 0 && self.ranges[idx - 1].upper >= upper
    }

    /// Drop everything at or below `watermark`, trimming a straddling range.
    pub fn purge(&mut self, watermark: u64) {
        self.ranges.retain(|r| r.upper > watermark);
        if let Some(first) = self.ranges.first_mut() {
            if first.lower <= watermark {
                first.lower = watermark + 1;
            }
        }
    }

    /// Merge every range of `other` into this set.
    pub fn union(&mut self, other: &AckRangeSet) {
        if other.ranges.is_empty() {
            return;
        }
        self.ranges.extend_from_slice(&other.ranges);
        self.merge();
    }

    pub fn ranges(&self) -> &[AckRange] {
        &self.ranges
    }

    /// Number of ranges (not numbers).
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total count of acknowledged numbers.
    pub fn acknowledged_count(&self) -> u64 {
        self.ranges.iter().map(AckRange::len).sum()
    }

    /// Count of acknowledged numbers in `[1, upto]`.
    pub fn acknowledged_within(&self, upto: u64) -> u64 {
        self.ranges
            .iter()
            .take_while(|r| r.lower <= upto)
            .map(|r| r.upper.min(upto) - r.lower + 1)
            .sum()
    }

    /// Highest acknowledged number, if any.
    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper)
    }

    /// Upper bound of the range starting at 1, or 0 if 1 is missing.
    pub fn contiguous_prefix(&self) -> u64 {
        match self.ranges.first() {
            Some(first) if first.lower <= 1 => first.upper,
            _ => 0,
        }
    }

    /// Flatten to `[lower0, upper0, lower1, upper1, ...]`.
    pub fn to_pairs(&self) -> Vec<u64> {
        self.ranges
            .iter()
            .flat_map(|r| [r.lower, r.upper])
            .collect()
    }
}

impl fmt::Display for AckRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

/// A `SequenceAcknowledgement` as received from (or sent to) a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAcknowledgement {
    pub identifier: Identifier,
    pub ranges: AckRangeSet,
}

impl SequenceAcknowledgement {
    pub fn new(identifier: Identifier, ranges: AckRangeSet) -> Self {
        Self { identifier, ranges }
    }
}
