// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound sequences of one endpoint.

use crate::error::{Result, RmError, SequenceFault};
use crate::identifier::Identifier;
use crate::message::{MessageContext, RmMessage};
use crate::metrics::RmMetrics;
use crate::sequence::destination::{AckOutcome, DestinationSequence};
use crate::store::{log_failure, RmStore};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of destination sequences.
pub struct Destination {
    endpoint: String,
    sequences: DashMap<Identifier, Arc<DestinationSequence>>,
    store: Option<Arc<dyn RmStore>>,
    metrics: Arc<RmMetrics>,
}

impl Destination {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        store: Option<Arc<dyn RmStore>>,
        metrics: Arc<RmMetrics>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            sequences: DashMap::new(),
            store,
            metrics,
        }
    }

    pub fn get_sequence(&self, id: &Identifier) -> Option<Arc<DestinationSequence>> {
        self.sequences.get(id).map(|s| Arc::clone(&s))
    }

    pub fn all_sequences(&self) -> Vec<Arc<DestinationSequence>> {
        let mut all: Vec<_> = self.sequences.iter().map(|s| Arc::clone(s.value())).collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        all
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub(crate) fn add_sequence(&self, seq: Arc<DestinationSequence>, persist: bool) {
        if persist {
            if let Some(store) = &self.store {
                log_failure(
                    "create_destination_sequence",
                    store.create_destination_sequence(&seq.to_record(&self.endpoint)),
                );
            }
        }
        log::debug!(
            "[destination:{}] added sequence {}",
            self.endpoint,
            seq.identifier()
        );
        self.sequences.insert(seq.identifier().clone(), seq);
    }

    pub(crate) fn remove_sequence(&self, id: &Identifier) -> Option<Arc<DestinationSequence>> {
        let removed = self.sequences.remove(id).map(|(_, s)| s);
        if let Some(store) = &self.store {
            log_failure("remove_destination_sequence", store.remove_destination_sequence(id));
        }
        removed
    }

    /// Resolve a referenced sequence or fault with `UnknownSequence`.
    pub fn require(&self, id: &Identifier) -> Result<Arc<DestinationSequence>> {
        self.get_sequence(id)
            .ok_or_else(|| SequenceFault::unknown_sequence(id.clone()).into())
    }

    /// Record the number carried by an inbound application message.
    ///
    /// Persists the sequence (and a copy of the message when a store is
    /// configured) and arranges for the acknowledgement: none when the
    /// message also closes the sequence, immediate when the range set has
    /// gaps, otherwise rate-based.
    pub fn acknowledge(
        &self,
        message: &dyn MessageContext,
    ) -> Result<(Arc<DestinationSequence>, AckOutcome)> {
        let header = message.sequence_header().ok_or_else(|| {
            RmError::Protocol("application message without Sequence header".into())
        })?;
        let seq = self.require(&header.identifier)?;

        if header.last_message {
            seq.set_last_message_number(header.message_number);
        }
        let outcome = seq.acknowledge(header.message_number)?;
        if !outcome.newly_acknowledged {
            log::debug!(
                "[destination:{}] {}#{} received again",
                self.endpoint,
                seq.identifier(),
                header.message_number
            );
        }
        let ranges = seq.acknowledged_ranges().len();
        self.metrics.record_received(outcome.has_gaps, ranges);

        if let (true, Some(store)) = (outcome.newly_acknowledged, &self.store) {
            let stored = RmMessage::from_context(message).to_stored();
            log_failure(
                "persist_incoming",
                store.persist_incoming(&seq.to_record(&self.endpoint), stored.as_ref()),
            );
        }

        let config = seq.config();
        if message.rm_properties().close_sequence.is_none() {
            if outcome.has_gaps {
                seq.schedule_immediate_acknowledgement();
            } else {
                seq.schedule_acknowledgement(config.acknowledgement_interval());
            }
        }
        seq.schedule_sequence_termination(config.inactivity_timeout());
        Ok((seq, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RmConfiguration;
    use crate::error::SequenceFaultKind;
    use crate::message::{EndpointReference, RmProperties};
    use crate::store::MemoryStore;

    fn destination(store: Option<Arc<dyn RmStore>>) -> Destination {
        let d = Destination::new("ep", store, Arc::new(RmMetrics::new()));
        d.add_sequence(
            Arc::new(DestinationSequence::new(
                Identifier::new("d1"),
                EndpointReference::anonymous(),
                RmConfiguration::default(),
            )),
            true,
        );
        d
    }

    fn inbound(id: &str, n: u64) -> RmMessage {
        RmMessage::new(RmProperties::with_sequence(Identifier::new(id), n), vec![1, 2, 3])
    }

    #[test]
    fn test_missing_header_is_protocol_error() {
        let d = destination(None);
        let msg = RmMessage::new(RmProperties::default(), Vec::new());
        assert!(matches!(d.acknowledge(&msg), Err(RmError::Protocol(_))));
    }

    #[test]
    fn test_unknown_sequence_faults() {
        let d = destination(None);
        let err = d.acknowledge(&inbound("nope", 1)).unwrap_err();
        assert_eq!(err.fault_kind(), Some(SequenceFaultKind::UnknownSequence));
    }

    #[test]
    fn test_gap_marks_ack_pending() {
        let d = destination(None);
        let (seq, outcome) = d.acknowledge(&inbound("d1", 2)).unwrap();
        assert!(outcome.newly_acknowledged);
        assert!(!outcome.has_gaps);
        assert!(seq.send_acknowledgement());
        seq.acknowledgment_sent();

        d.acknowledge(&inbound("d1", 4)).unwrap();
        assert!(seq.send_acknowledgement());
        assert_eq!(seq.acknowledged_ranges().to_pairs(), vec![2, 2, 4, 4]);
    }

    #[test]
    fn test_last_message_flag_bounds_sequence() {
        let d = destination(None);
        let mut last = inbound("d1", 2);
        last.rm.sequence.as_mut().unwrap().last_message = true;
        let (seq, _) = d.acknowledge(&last).unwrap();
        assert_eq!(seq.last_message_number(), 2);
        let err = d.acknowledge(&inbound("d1", 3)).unwrap_err();
        assert_eq!(
            err.fault_kind(),
            Some(SequenceFaultKind::LastMessageNumberExceeded)
        );
    }

    #[test]
    fn test_received_copy_is_persisted_once() {
        let store = Arc::new(MemoryStore::new());
        let d = destination(Some(store.clone() as Arc<dyn RmStore>));
        d.acknowledge(&inbound("d1", 1)).unwrap();
        d.acknowledge(&inbound("d1", 1)).unwrap();
        let id = Identifier::new("d1");
        assert_eq!(store.message_count(&id, false), 1);
        let record = store.get_destination_sequence(&id).unwrap().unwrap();
        assert_eq!(record.acknowledged.to_pairs(), vec![1, 1]);

        d.remove_sequence(&id);
        assert!(store.get_destination_sequence(&id).unwrap().is_none());
    }
}
