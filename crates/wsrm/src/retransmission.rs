// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound messages awaiting acknowledgement.

use crate::config::RmConfiguration;
use crate::error::{Result, RmError};
use crate::identifier::Identifier;
use crate::message::{MessageContext, RmMessage};
use crate::metrics::RmMetrics;
use crate::retry::{RetryQueue, RetrySchedule, RetryStatus};
use crate::sequence::source::SourceSequence;
use crate::store::{log_failure, RmStore};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Transport used to send a message again.
pub trait Resender: Send + Sync {
    fn resend(&self, message: &RmMessage) -> Result<()>;
}

impl<F> Resender for F
where
    F: Fn(&RmMessage) -> Result<()> + Send + Sync,
{
    fn resend(&self, message: &RmMessage) -> Result<()> {
        self(message)
    }
}

/// Unacknowledged outbound messages with their resend schedules.
pub struct RetransmissionQueue {
    queue: RetryQueue,
    store: Option<Arc<dyn RmStore>>,
}

impl fmt::Debug for RetransmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetransmissionQueue")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl RetransmissionQueue {
    pub fn new(metrics: Arc<RmMetrics>, store: Option<Arc<dyn RmStore>>) -> Self {
        Self {
            queue: RetryQueue::new(
                "retransmission",
                metrics,
                RmMetrics::record_retransmit,
                false,
            ),
            store,
        }
    }

    /// Install `resender` and start the resend worker.
    pub fn start(&self, resender: Arc<dyn Resender>) -> std::io::Result<()> {
        self.queue
            .set_handler(Arc::new(move |m: &RmMessage| resender.resend(m)));
        self.queue.start()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Queue a sent message. The first resend is due after the base interval.
    pub fn add_unacknowledged(&self, message: RmMessage, config: &RmConfiguration) -> Result<()> {
        let header = message
            .sequence_header()
            .ok_or_else(|| RmError::Protocol("queued message has no Sequence header".into()))?;
        let id = header.identifier.clone();
        let number = header.message_number;
        let schedule = RetrySchedule::new(
            Instant::now(),
            config.base_retransmission_interval(),
            config.exponential_backoff,
            config.backoff_cap,
            config.max_retransmissions,
        );
        if !self.queue.add(id.clone(), number, message, schedule) {
            log::debug!("[retransmission] {}#{} already queued", id, number);
        }
        Ok(())
    }

    /// Drop entries covered by the sequence's acknowledged ranges.
    pub fn purge_acknowledged(&self, seq: &SourceSequence) -> Vec<u64> {
        let ranges = seq.acknowledged_ranges();
        let id = seq.identifier();
        let purged = self.queue.remove_where(id, |n| ranges.contains(n));
        if !purged.is_empty() {
            log::debug!("[retransmission] purged {} message(s) of {}", purged.len(), id);
            if let Some(store) = &self.store {
                log_failure("remove outbound messages", store.remove_messages(id, &purged, true));
            }
        }
        purged
    }

    /// Drop every queued message of `id`, acknowledged or not.
    pub fn purge_all(&self, id: &Identifier) -> Vec<u64> {
        let purged = self.queue.remove_where(id, |_| true);
        if !purged.is_empty() {
            if let Some(store) = &self.store {
                log_failure("remove outbound messages", store.remove_messages(id, &purged, true));
            }
        }
        purged
    }

    /// Discard all state for a terminated sequence.
    pub fn stop(&self, id: &Identifier) {
        let dropped = self.queue.remove_all(id);
        if !dropped.is_empty() {
            log::debug!(
                "[retransmission] stopped {} with {} message(s) outstanding",
                id,
                dropped.len()
            );
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

    pub fn count_unacknowledged(&self, id: &Identifier) -> usize {
        self.queue.count(id)
    }

    pub fn total(&self) -> usize {
        self.queue.total()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn unacknowledged_numbers(&self, id: &Identifier) -> Vec<u64> {
        self.queue.numbers(id)
    }

    pub fn unacknowledged_messages(&self, id: &Identifier) -> Vec<RmMessage> {
        self.queue.messages(id)
    }

    pub fn sequence_ids(&self) -> Vec<Identifier> {
        self.queue.sequence_ids()
    }

    pub fn retransmission_status(&self, id: &Identifier, number: u64) -> Option<RetryStatus> {
        self.queue.status(id, number)
    }

    pub fn retransmission_statuses(&self, id: &Identifier) -> Vec<RetryStatus> {
        self.queue.statuses(id)
    }

    /// Resend every due entry now. Used by the worker and by tests.
    pub fn resend_due(&self, now: Instant) -> usize {
        self.queue.attempt_due(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack_range::{AckRange, AckRangeSet};
    use crate::config::ProtocolVariation;
    use crate::message::RmProperties;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn config() -> RmConfiguration {
        RmConfiguration::builder()
            .base_retransmission_interval(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn sent(seq: &SourceSequence) -> RmMessage {
        let n = seq.next_message_number().unwrap();
        RmMessage::new(
            RmProperties::with_sequence(seq.identifier().clone(), n),
            vec![n as u8],
        )
    }

    #[test]
    fn test_add_requires_sequence_header() {
        let q = RetransmissionQueue::new(Arc::new(RmMetrics::new()), None);
        let control = RmMessage::new(RmProperties::default(), Vec::new());
        assert!(matches!(
            q.add_unacknowledged(control, &config()),
            Err(RmError::Protocol(_))
        ));
    }

    #[test]
    fn test_purge_removes_exactly_covered_entries() {
        let store = Arc::new(MemoryStore::new());
        let q = Arc::new(RetransmissionQueue::new(
            Arc::new(RmMetrics::new()),
            Some(store.clone() as Arc<dyn RmStore>),
        ));
        let seq = SourceSequence::new(Identifier::new("s1"), ProtocolVariation::default());
        seq.attach_retransmission_queue(Arc::clone(&q));
        let cfg = config();
        for _ in 0..5 {
            let m = sent(&seq);
            store
                .persist_outgoing(&seq.to_record("ep"), m.to_stored().as_ref())
                .unwrap();
            q.add_unacknowledged(m, &cfg).unwrap();
        }
        assert_eq!(q.count_unacknowledged(seq.identifier()), 5);

        let purged = seq
            .set_acknowledged(&AckRangeSet::from_ranges([
                AckRange::new(1, 2),
                AckRange::new(4, 4),
            ]))
            .unwrap();
        assert_eq!(purged, vec![1, 2, 4]);
        assert_eq!(q.unacknowledged_numbers(seq.identifier()), vec![3, 5]);
        assert_eq!(store.message_count(seq.identifier(), true), 2);
    }

    #[test]
    fn test_resend_due_calls_resender_and_counts() {
        let metrics = Arc::new(RmMetrics::new());
        let q = RetransmissionQueue::new(Arc::clone(&metrics), None);
        let resent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&resent);
        q.queue.set_handler(Arc::new(move |m: &RmMessage| -> Result<()> {
            log.lock().push(m.message_number());
            Ok(())
        }));

        let seq = SourceSequence::new(Identifier::new("s1"), ProtocolVariation::default());
        let cfg = config();
        q.add_unacknowledged(sent(&seq), &cfg).unwrap();
        q.add_unacknowledged(sent(&seq), &cfg).unwrap();

        assert_eq!(q.resend_due(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(150);
        assert_eq!(q.resend_due(later), 2);
        assert_eq!(*resent.lock(), vec![Some(1), Some(2)]);
        assert_eq!(metrics.retransmits_sent(), 2);

        let status = q.retransmission_status(seq.identifier(), 1).unwrap();
        assert_eq!(status.attempts, 1);
        assert_eq!(status.backoff, 1);
    }

    #[test]
    fn test_suspend_keeps_entries() {
        let q = RetransmissionQueue::new(Arc::new(RmMetrics::new()), None);
        q.queue.set_handler(Arc::new(|_m: &RmMessage| -> Result<()> { Ok(()) }));
        let seq = SourceSequence::new(Identifier::new("s1"), ProtocolVariation::default());
        q.add_unacknowledged(sent(&seq), &config()).unwrap();

        q.suspend(seq.identifier());
        assert!(q.is_suspended(seq.identifier()));
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(q.resend_due(later), 0);
        assert_eq!(q.count_unacknowledged(seq.identifier()), 1);

        q.resume(seq.identifier());
        assert_eq!(q.resend_due(later), 1);
    }

    #[test]
    fn test_stop_discards_sequence() {
        let q = RetransmissionQueue::new(Arc::new(RmMetrics::new()), None);
        let seq = SourceSequence::new(Identifier::new("s1"), ProtocolVariation::default());
        q.add_unacknowledged(sent(&seq), &config()).unwrap();
        q.suspend(seq.identifier());
        q.stop(seq.identifier());
        assert!(q.is_empty());
        assert!(!q.is_suspended(seq.identifier()));
    }
}
