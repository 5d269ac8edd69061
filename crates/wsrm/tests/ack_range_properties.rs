// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Randomized checks of `AckRangeSet` against a plain set model.

use std::collections::BTreeSet;
use wsrm::{AckRange, AckRangeSet};

const ROUNDS: usize = 200;

fn assert_normalized(set: &AckRangeSet) {
    for pair in set.ranges().windows(2) {
        assert!(
            pair[0].upper + 1 < pair[1].lower,
            "ranges {} and {} overlap or touch",
            pair[0],
            pair[1]
        );
    }
    for r in set.ranges() {
        assert!(r.lower >= 1 && r.lower <= r.upper);
    }
}

fn assert_matches_model(set: &AckRangeSet, model: &BTreeSet<u64>, max: u64) {
    assert_normalized(set);
    assert_eq!(set.acknowledged_count(), model.len() as u64);
    for n in 1..=max + 1 {
        assert_eq!(set.contains(n), model.contains(&n), "number {}", n);
    }
    let prefix = (1..).take_while(|n| model.contains(n)).last().unwrap_or(0);
    assert_eq!(set.contiguous_prefix(), prefix);
    assert_eq!(set.highest(), model.iter().next_back().copied());
}

#[test]
fn test_incremental_acknowledge_matches_model() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0001);
    for _ in 0..ROUNDS {
        let max = rng.u64(1..64);
        let mut set = AckRangeSet::new();
        let mut model = BTreeSet::new();
        for _ in 0..rng.usize(1..96) {
            let n = rng.u64(1..=max);
            assert_eq!(set.acknowledge(n), model.insert(n));
        }
        assert_matches_model(&set, &model, max);
    }
}

#[test]
fn test_merge_of_raw_ranges_matches_model() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0002);
    for _ in 0..ROUNDS {
        let max = rng.u64(1..128);
        let mut raw = Vec::new();
        let mut model = BTreeSet::new();
        for _ in 0..rng.usize(0..12) {
            let lower = rng.u64(1..=max);
            let upper = rng.u64(lower..=max);
            raw.push(AckRange::new(lower, upper));
            model.extend(lower..=upper);
        }
        let mut set = AckRangeSet::from_raw_ranges(raw);
        set.merge();
        assert_matches_model(&set, &model, max);
    }
}

#[test]
fn test_union_and_coverage_match_model() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0003);
    for _ in 0..ROUNDS {
        let max = rng.u64(1..48);
        let mut left = AckRangeSet::new();
        let mut right = AckRangeSet::new();
        let mut model = BTreeSet::new();
        for _ in 0..rng.usize(0..32) {
            let n = rng.u64(1..=max);
            if rng.bool() {
                left.acknowledge(n);
            } else {
                right.acknowledge(n);
            }
            model.insert(n);
        }
        left.union(&right);
        assert_matches_model(&left, &model, max);

        let lower = rng.u64(1..=max);
        let upper = rng.u64(lower..=max);
        let covered = (lower..=upper).all(|n| model.contains(&n));
        assert_eq!(left.covers(lower, upper), covered);

        let upto = rng.u64(0..=max);
        let within = model.range(..=upto).count() as u64;
        assert_eq!(left.acknowledged_within(upto), within);
    }
}

#[test]
fn test_purge_drops_everything_at_or_below_watermark() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0004);
    for _ in 0..ROUNDS {
        let max = rng.u64(1..64);
        let mut set = AckRangeSet::new();
        let mut model = BTreeSet::new();
        for _ in 0..rng.usize(0..48) {
            let n = rng.u64(1..=max);
            set.acknowledge(n);
            model.insert(n);
        }
        let watermark = rng.u64(0..=max);
        set.purge(watermark);
        model.retain(|&n| n > watermark);

        assert_normalized(&set);
        assert_eq!(set.acknowledged_count(), model.len() as u64);
        for n in 1..=max {
            assert_eq!(set.contains(n), model.contains(&n));
        }
    }
}
