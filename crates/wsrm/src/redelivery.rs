// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound messages the application has not yet taken.
//!
//! A message lands here when delivery to the application fails. The
//! destination retry policy decides whether and how often the
//! [`Redeliverer`] is asked to try again; a successful attempt removes the
//! entry and its persisted copy.

use crate::config::RetryPolicy;
use crate::error::{Result, RmError};
use crate::identifier::Identifier;
use crate::message::{MessageContext, RmMessage};
use crate::metrics::RmMetrics;
use crate::retry::{RetryQueue, RetrySchedule, RetryStatus};
use crate::store::{log_failure, RmStore};
use std::sync::Arc;
use std::time::Instant;

/// Application-facing dispatcher used for redelivery attempts.
pub trait Redeliverer: Send + Sync {
    fn redeliver(&self, message: &RmMessage) -> Result<()>;
}

impl<F> Redeliverer for F
where
    F: Fn(&RmMessage) -> Result<()> + Send + Sync,
{
    fn redeliver(&self, message: &RmMessage) -> Result<()> {
        self(message)
    }
}

pub struct RedeliveryQueue {
    queue: RetryQueue,
    store: Option<Arc<dyn RmStore>>,
}

impl RedeliveryQueue {
    pub fn new(metrics: Arc<RmMetrics>, store: Option<Arc<dyn RmStore>>) -> Self {
        Self {
            queue: RetryQueue::new("redelivery", metrics, RmMetrics::record_redelivery, true),
            store,
        }
    }

    pub fn start(&self, redeliverer: Arc<dyn Redeliverer>) -> std::io::Result<()> {
        let store = self.store.clone();
        self.queue.set_handler(Arc::new(move |m: &RmMessage| -> Result<()> {
            redeliverer.redeliver(m)?;
            if let (Some(store), Some(h)) = (&store, m.sequence_header()) {
                log_failure(
                    "remove inbound message",
                    store.remove_messages(&h.identifier, &[h.message_number], false),
                );
            }
            Ok(())
        }));
        self.queue.start()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Queue an undelivered message. A disabled policy keeps the message
    /// without scheduling attempts.
    pub fn add_undelivered(&self, message: RmMessage, policy: &RetryPolicy) -> Result<()> {
        let header = message
            .sequence_header()
            .ok_or_else(|| RmError::Protocol("undelivered message has no Sequence header".into()))?;
        let id = header.identifier.clone();
        let number = header.message_number;
        let schedule = RetrySchedule::new(
            Instant::now(),
            policy.interval(),
            policy.exponential_backoff,
            crate::config::DEFAULT_BACKOFF_CAP,
            policy.max_retries,
        );
        if self.queue.add(id.clone(), number, message, schedule) {
            log::debug!("[redelivery] queued {}#{}", id, number);
        }
        Ok(())
    }

    /// Drop every undelivered message of `id` and its persisted copies.
    pub fn purge_all(&self, id: &Identifier) -> Vec<u64> {
        let purged = self.queue.remove_where(id, |_| true);
        if !purged.is_empty() {
            if let Some(store) = &self.store {
                log_failure("remove inbound messages", store.remove_messages(id, &purged, false));
            }
        }
        purged
    }

    pub fn stop(&self, id: &Identifier) {
        let dropped = self.queue.remove_all(id);
        if !dropped.is_empty() {
            log::debug!("[redelivery] stopped {} with {} undelivered", id, dropped.len());
        }
    }

    pub fn suspend(&self, id: &Identifier) {
        self.queue.suspend(id);
    }

    pub fn resume(&self, id: &Identifier) {
        self.queue.resume(id);
    }

    pub fn is_suspended(&self, id: &Identifier) -> bool {
        self.queue.is_suspended(id)
    }

    pub fn count_undelivered(&self, id: &Identifier) -> usize {
        self.queue.count(id)
    }

    pub fn total(&self) -> usize {
        self.queue.total()
    }

    pub fn undelivered_numbers(&self, id: &Identifier) -> Vec<u64> {
        self.queue.numbers(id)
    }

    pub fn sequence_ids(&self) -> Vec<Identifier> {
        self.queue.sequence_ids()
    }

    pub fn redelivery_status(&self, id: &Identifier, number: u64) -> Option<RetryStatus> {
        self.queue.status(id, number)
    }

    pub fn redelivery_statuses(&self, id: &Identifier) -> Vec<RetryStatus> {
        self.queue.statuses(id)
    }

    pub fn redeliver_due(&self, now: Instant) -> usize {
        self.queue.attempt_due(now)
    }
}
