// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message rate monitoring and delivery callbacks.

use crate::identifier::Identifier;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default width of the rate window.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Sliding-window receipt counter for one destination sequence.
///
/// Reports 0 until one full window has elapsed since the first receipt, so a
/// short burst at sequence start does not look like sustained traffic.
#[derive(Debug)]
pub struct SequenceMonitor {
    interval: Duration,
    first_check: Option<Instant>,
    receipts: VecDeque<Instant>,
}

impl SequenceMonitor {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_MONITOR_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            first_check: None,
            receipts: VecDeque::new(),
        }
    }

    pub fn acknowledge_message(&mut self, now: Instant) {
        if self.first_check.is_none() {
            self.first_check = Some(now + self.interval);
        }
        self.prune(now);
        self.receipts.push_back(now);
    }

    /// Receipts within the trailing window ending at `now`.
    pub fn messages_per_minute(&mut self, now: Instant) -> u32 {
        match self.first_check {
            Some(first) if now >= first => {}
            _ => return 0,
        }
        self.prune(now);
        self.receipts.len() as u32
    }

    /// Receipts currently held, at most one window's worth.
    pub fn retained(&self) -> usize {
        self.receipts.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.receipts.front() {
            if now.saturating_duration_since(oldest) > self.interval {
                self.receipts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SequenceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer of outbound message progress.
pub trait MessageCallback: Send + Sync {
    /// A message number was assigned on `sequence`.
    fn message_accepted(&self, sequence: &Identifier, number: u64);

    /// The peer acknowledged `number` on `sequence`.
    fn message_acknowledged(&self, sequence: &Identifier, number: u64);
}

/// Counts accepted/acknowledged messages and lets a caller wait for totals.
#[derive(Debug, Default)]
pub struct MessageCountingCallback {
    counts: Mutex<(u64, u64)>,
    changed: Condvar,
}

impl MessageCountingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.counts.lock().0
    }

    pub fn acknowledged(&self) -> u64 {
        self.counts.lock().1
    }

    /// Block until at least `accepted`/`acknowledged` messages were counted.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for(&self, accepted: u64, acknowledged: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock();
        while counts.0 < accepted || counts.1 < acknowledged {
            if self.changed.wait_until(&mut counts, deadline).timed_out() {
                return counts.0 >= accepted && counts.1 >= acknowledged;
            }
        }
        true
    }
}

impl MessageCallback for MessageCountingCallback {
    fn message_accepted(&self, _sequence: &Identifier, _number: u64) {
        self.counts.lock().0 += 1;
        self.changed.notify_all();
    }

    fn message_acknowledged(&self, _sequence: &Identifier, _number: u64) {
        self.counts.lock().1 += 1;
        self.changed.notify_all();
    }
}
