// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counters for reliable messaging activity.
//!
//! All updates are single `fetch_add` calls with `Relaxed` ordering; a
//! [`snapshot`](RmMetrics::snapshot) is therefore not a consistent cut across
//! counters, which is fine for reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reliable messaging metrics collector, shared by all endpoints of a manager.
#[derive(Debug, Default)]
pub struct RmMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    out_of_order: AtomicU64,
    duplicates_dropped: AtomicU64,
    acks_sent: AtomicU64,
    acks_failed: AtomicU64,
    retransmits_sent: AtomicU64,
    retransmit_failures: AtomicU64,
    redeliveries: AtomicU64,
    redelivery_failures: AtomicU64,
    sequences_created: AtomicU64,
    sequences_terminated: AtomicU64,
    inactivity_terminations: AtomicU64,
    /// Largest number of ranges seen in one inbound acknowledgement set.
    max_ack_ranges: AtomicU64,
}

/// Point-in-time copy of [`RmMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RmMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub out_of_order: u64,
    pub duplicates_dropped: u64,
    pub acks_sent: u64,
    pub acks_failed: u64,
    pub retransmits_sent: u64,
    pub retransmit_failures: u64,
    pub redeliveries: u64,
    pub redelivery_failures: u64,
    pub sequences_created: u64,
    pub sequences_terminated: u64,
    pub inactivity_terminations: u64,
    pub max_ack_ranges: u64,
}

impl RmMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound application message and the range count it left.
    pub fn record_received(&self, out_of_order: bool, ranges: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if out_of_order {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
        let ranges = ranges as u64;
        let mut current = self.max_ack_ranges.load(Ordering::Relaxed);
        while ranges > current {
            match self.max_ack_ranges.compare_exchange_weak(
                current,
                ranges,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn increment_duplicates(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self, ok: bool) {
        if ok {
            self.acks_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.acks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retransmit(&self, ok: bool) {
        if ok {
            self.retransmits_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.retransmit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_redelivery(&self, ok: bool) {
        if ok {
            self.redeliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.redelivery_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_sequences_created(&self) {
        self.sequences_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sequences_terminated(&self, inactive: bool) {
        self.sequences_terminated.fetch_add(1, Ordering::Relaxed);
        if inactive {
            self.inactivity_terminations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn retransmits_sent(&self) -> u64 {
        self.retransmits_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RmMetricsSnapshot {
        RmMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            acks_failed: self.acks_failed.load(Ordering::Relaxed),
            retransmits_sent: self.retransmits_sent.load(Ordering::Relaxed),
            retransmit_failures: self.retransmit_failures.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            redelivery_failures: self.redelivery_failures.load(Ordering::Relaxed),
            sequences_created: self.sequences_created.load(Ordering::Relaxed),
            sequences_terminated: self.sequences_terminated.load(Ordering::Relaxed),
            inactivity_terminations: self.inactivity_terminations.load(Ordering::Relaxed),
            max_ack_ranges: self.max_ack_ranges.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_received,
            &self.out_of_order,
            &self.duplicates_dropped,
            &self.acks_sent,
            &self.acks_failed,
            &self.retransmits_sent,
            &self.retransmit_failures,
            &self.redeliveries,
            &self.redelivery_failures,
            &self.sequences_created,
            &self.sequences_terminated,
            &self.inactivity_terminations,
            &self.max_ack_ranges,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters() {
        let m = RmMetrics::new();
        m.increment_sent();
        m.record_received(true, 3);
        m.record_received(false, 1);
        m.record_retransmit(true);
        m.record_retransmit(false);
        m.increment_sequences_terminated(true);

        let s = m.snapshot();
        assert_eq!(s.messages_sent, 1);
        assert_eq!(s.messages_received, 2);
        assert_eq!(s.out_of_order, 1);
        assert_eq!(s.max_ack_ranges, 3);
        assert_eq!(s.retransmits_sent, 1);
        assert_eq!(s.retransmit_failures, 1);
        assert_eq!(s.inactivity_terminations, 1);

        m.reset();
        assert_eq!(m.snapshot(), RmMetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_max_ranges() {
        let m = Arc::new(RmMetrics::new());
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_received(false, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = m.snapshot();
        assert_eq!(s.messages_received, 800);
        assert_eq!(s.max_ack_ranges, 8);
    }
}
