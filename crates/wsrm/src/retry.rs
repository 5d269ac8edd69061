// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-sequence retry queue shared by retransmission and redelivery.
//!
//! Entries are keyed by `(sequence, message number)`. A background worker
//! wakes at the earliest deadline (or when new work is added), hands every
//! due entry of a non-suspended sequence to the installed handler outside the
//! queue lock, then updates the entry's backoff schedule.

use crate::error::Result;
use crate::identifier::Identifier;
use crate::message::RmMessage;
use crate::metrics::RmMetrics;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Longest the worker sleeps without a deadline.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Backoff bookkeeping of one entry.
#[derive(Debug, Clone)]
pub(crate) struct RetrySchedule {
    base: Duration,
    exponential: bool,
    cap: u32,
    max_attempts: Option<u32>,
    attempts: u32,
    next: Option<Instant>,
    previous: Option<Instant>,
}

impl RetrySchedule {
    pub(crate) fn new(
        now: Instant,
        base: Duration,
        exponential: bool,
        cap: u32,
        max_attempts: Option<u32>,
    ) -> Self {
        let next = if max_attempts == Some(0) {
            None
        } else {
            now.checked_add(base)
        };
        Self {
            base,
            exponential,
            cap,
            max_attempts,
            attempts: 0,
            next,
            previous: None,
        }
    }

    /// Delay between attempt `attempts` and the one after it.
    fn interval_after(&self, attempts: u32) -> Duration {
        if self.exponential {
            self.base
                .saturating_mul(1u32 << attempts.min(self.cap).min(31))
        } else {
            self.base
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.next.is_some_and(|n| n <= now)
    }

    fn attempted(&mut self, now: Instant) {
        self.attempts += 1;
        self.previous = Some(now);
        self.next = if self.exhausted() {
            None
        } else {
            now.checked_add(self.interval_after(self.attempts))
        };
    }

    fn exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|m| self.attempts >= m)
    }

    fn resume(&mut self, now: Instant) {
        if self.next.is_some() {
            self.next = Some(now);
        }
    }
}

/// Introspection view of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryStatus {
    pub number: u64,
    /// Attempts made so far.
    pub attempts: u32,
    pub max_attempts: Option<u32>,
    #[serde(skip)]
    pub next: Option<Instant>,
    #[serde(skip)]
    pub previous: Option<Instant>,
    pub next_interval: Duration,
    /// Multiplier applied between attempts (1 or 2).
    pub backoff: u32,
    pub suspended: bool,
}

pub(crate) type Handler = Arc<dyn Fn(&RmMessage) -> Result<()> + Send + Sync>;

struct Entry {
    message: RmMessage,
    schedule: RetrySchedule,
}

#[derive(Default)]
struct SequenceEntries {
    suspended: bool,
    entries: BTreeMap<u64, Entry>,
}

struct Shared {
    label: &'static str,
    sequences: Mutex<HashMap<Identifier, SequenceEntries>>,
    handler: RwLock<Option<Handler>>,
    metrics: Arc<RmMetrics>,
    record: fn(&RmMetrics, bool),
    /// Drop an entry once an attempt succeeds.
    complete_on_success: bool,
}

impl Shared {
    fn attempt_due(&self, now: Instant) -> usize {
        let Some(handler) = self.handler.read().clone() else {
            return 0;
        };

        let due: Vec<(Identifier, u64, RmMessage)> = {
            let sequences = self.sequences.lock();
            sequences
                .iter()
                .filter(|(_, s)| !s.suspended)
                .flat_map(|(id, s)| {
                    s.entries
                        .iter()
                        .filter(|(_, e)| e.schedule.is_due(now))
                        .map(move |(n, e)| (id.clone(), *n, e.message.clone()))
                })
                .collect()
        };

        let mut succeeded = 0;
        for (id, number, message) in due {
            let result = handler(&message);
            (self.record)(&self.metrics, result.is_ok());
            match &result {
                Ok(()) => succeeded += 1,
                Err(e) => log::warn!(
                    "[{}] attempt for {}#{} failed: {}",
                    self.label,
                    id,
                    number,
                    e
                ),
            }

            let mut sequences = self.sequences.lock();
            let Some(seq) = sequences.get_mut(&id) else {
                continue;
            };
            if result.is_ok() && self.complete_on_success {
                seq.entries.remove(&number);
                if seq.entries.is_empty() && !seq.suspended {
                    sequences.remove(&id);
                }
                continue;
            }
            if let Some(entry) = seq.entries.get_mut(&number) {
                entry.schedule.attempted(now);
                if entry.schedule.exhausted() {
                    log::warn!(
                        "[{}] giving up on {}#{} after {} attempts",
                        self.label,
                        id,
                        number,
                        entry.schedule.attempts
                    );
                }
            }
        }
        succeeded
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sequences
            .lock()
            .values()
            .filter(|s| !s.suspended)
            .flat_map(|s| s.entries.values().filter_map(|e| e.schedule.next))
            .min()
    }
}

struct Worker {
    wake_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Worker {
    fn spawn(name: String, shared: Arc<Shared>) -> std::io::Result<Self> {
        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let handle = std::thread::Builder::new().name(name).spawn(move || loop {
            shared.attempt_due(Instant::now());
            let wait = shared
                .next_deadline()
                .map_or(IDLE_WAIT, |d| d.saturating_duration_since(Instant::now()))
                .min(IDLE_WAIT);
            match wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(Self {
            wake_tx: Some(wake_tx),
            thread_id: handle.thread().id(),
            thread: Some(handle),
        })
    }

    fn wake(&self) {
        if let Some(tx) = &self.wake_tx {
            // a full channel already carries a pending wake-up
            let _ = tx.try_send(());
        }
    }

    fn stop(&mut self) {
        drop(self.wake_tx.take());
        if std::thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Message queue with per-entry retry schedules.
pub(crate) struct RetryQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RetryQueue {
    pub(crate) fn new(
        label: &'static str,
        metrics: Arc<RmMetrics>,
        record: fn(&RmMetrics, bool),
        complete_on_success: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                label,
                sequences: Mutex::new(HashMap::new()),
                handler: RwLock::new(None),
                metrics,
                record,
                complete_on_success,
            }),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn set_handler(&self, handler: Handler) {
        *self.shared.handler.write() = Some(handler);
        self.wake();
    }

    /// Start the background worker. Idempotent.
    pub(crate) fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let name = format!("wsrm-{}", self.shared.label);
            *worker = Some(Worker::spawn(name, Arc::clone(&self.shared))?);
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        let worker = self.worker.lock().take();
        drop(worker);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    fn wake(&self) {
        if let Some(w) = self.worker.lock().as_ref() {
            w.wake();
        }
    }

    /// Queue `message` unless `number` is already queued for `id`.
    pub(crate) fn add(
        &self,
        id: Identifier,
        number: u64,
        message: RmMessage,
        schedule: RetrySchedule,
    ) -> bool {
        let added = {
            let mut sequences = self.shared.sequences.lock();
            let seq = sequences.entry(id).or_default();
            if seq.entries.contains_key(&number) {
                false
            } else {
                seq.entries.insert(number, Entry { message, schedule });
                true
            }
        };
        if added {
            self.wake();
        }
        added
    }

    pub(crate) fn count(&self, id: &Identifier) -> usize {
        self.shared
            .sequences
            .lock()
            .get(id)
            .map_or(0, |s| s.entries.len())
    }

    pub(crate) fn total(&self) -> usize {
        self.shared
            .sequences
            .lock()
            .values()
            .map(|s| s.entries.len())
            .sum()
    }

    pub(crate) fn numbers(&self, id: &Identifier) -> Vec<u64> {
        self.shared
            .sequences
            .lock()
            .get(id)
            .map(|s| s.entries.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn messages(&self, id: &Identifier) -> Vec<RmMessage> {
        self.shared
            .sequences
            .lock()
            .get(id)
            .map(|s| s.entries.values().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn sequence_ids(&self) -> Vec<Identifier> {
        self.shared
            .sequences
            .lock()
            .iter()
            .filter(|(_, s)| !s.entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove entries of `id` whose number matches `pred`.
    pub(crate) fn remove_where(&self, id: &Identifier, pred: impl Fn(u64) -> bool) -> Vec<u64> {
        let mut sequences = self.shared.sequences.lock();
        let Some(seq) = sequences.get_mut(id) else {
            return Vec::new();
        };
        let removed: Vec<u64> = seq.entries.keys().copied().filter(|&n| pred(n)).collect();
        for n in &removed {
            seq.entries.remove(n);
        }
        if seq.entries.is_empty() && !seq.suspended {
            sequences.remove(id);
        }
        removed
    }

    /// Drop every entry and the suspension flag of `id`.
    pub(crate) fn remove_all(&self, id: &Identifier) -> Vec<u64> {
        self.shared
            .sequences
            .lock()
            .remove(id)
            .map(|s| s.entries.into_keys().collect())
            .unwrap_or_default()
    }

    pub(crate) fn suspend(&self, id: &Identifier) {
        self.shared
            .sequences
            .lock()
            .entry(id.clone())
            .or_default()
            .suspended = true;
    }

    pub(crate) fn resume(&self, id: &Identifier) {
        let now = Instant::now();
        {
            let mut sequences = self.shared.sequences.lock();
            if let Some(seq) = sequences.get_mut(id) {
                seq.suspended = false;
                for entry in seq.entries.values_mut() {
                    entry.schedule.resume(now);
                }
            }
        }
        self.wake();
    }

    pub(crate) fn is_suspended(&self, id: &Identifier) -> bool {
        self.shared
            .sequences
            .lock()
            .get(id)
            .is_some_and(|s| s.suspended)
    }

    pub(crate) fn status(&self, id: &Identifier, number: u64) -> Option<RetryStatus> {
        let sequences = self.shared.sequences.lock();
        let seq = sequences.get(id)?;
        seq.entries
            .get(&number)
            .map(|e| Self::status_of(number, e, seq.suspended))
    }

    pub(crate) fn statuses(&self, id: &Identifier) -> Vec<RetryStatus> {
        let sequences = self.shared.sequences.lock();
        sequences
            .get(id)
            .map(|seq| {
                seq.entries
                    .iter()
                    .map(|(n, e)| Self::status_of(*n, e, seq.suspended))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn status_of(number: u64, entry: &Entry, suspended: bool) -> RetryStatus {
        let s = &entry.schedule;
        RetryStatus {
            number,
            attempts: s.attempts,
            max_attempts: s.max_attempts,
            next: s.next,
            previous: s.previous,
            next_interval: s.interval_after(s.attempts),
            backoff: if s.exponential { 2 } else { 1 },
            suspended,
        }
    }

    /// Run one pass over due entries. Returns successful attempts.
    pub(crate) fn attempt_due(&self, now: Instant) -> usize {
        self.shared.attempt_due(now)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.shared.next_deadline()
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
