// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operator view of a reliable endpoint.
//!
//! Read-only queries return plain values or serde-serializable snapshots so
//! an admin surface can render them as JSON. The mutating operations
//! (suspend, resume, close, terminate, remove, purge) act on one sequence at
//! a time and refuse to drop a sequence that still has queued messages.

use crate::endpoint::{EndpointActivity, RmEndpoint};
use crate::error::{Result, RmError};
use crate::identifier::Identifier;
use crate::message::millis_since_epoch;
use crate::metrics::RmMetricsSnapshot;
use crate::retry::RetryStatus;
use crate::sequence::destination::{DestinationSequence, DestinationState};
use crate::sequence::source::{SourceSequence, SourceState};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSequenceInfo {
    pub identifier: Identifier,
    pub state: SourceState,
    pub current_message_number: u64,
    pub last_message: bool,
    pub expires_ms: Option<u64>,
    pub offering_id: Option<Identifier>,
    pub target: Option<String>,
    pub queued: usize,
    /// Flattened `[lower, upper, ...]` pairs.
    pub acknowledged: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSequenceInfo {
    pub identifier: Identifier,
    pub state: DestinationState,
    pub acks_to: String,
    pub last_message_number: u64,
    pub acknowledged: Vec<u64>,
    pub ack_pending: bool,
    pub deferred_acknowledgements: usize,
    pub undelivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub name: String,
    pub source_sequences: usize,
    pub destination_sequences: usize,
    pub queued_outbound: usize,
    pub queued_inbound: usize,
    pub activity: EndpointActivity,
    pub metrics: RmMetricsSnapshot,
}

/// Management handle for one endpoint.
#[derive(Debug, Clone)]
pub struct ManagedEndpoint {
    endpoint: Arc<RmEndpoint>,
}

impl ManagedEndpoint {
    pub fn new(endpoint: Arc<RmEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<RmEndpoint> {
        &self.endpoint
    }

    fn source_sequence(&self, id: &Identifier) -> Result<Arc<SourceSequence>> {
        self.endpoint
            .source()
            .get_sequence(id)
            .ok_or_else(|| RmError::InvalidState(format!("no source sequence {}", id)))
    }

    fn destination_sequence(&self, id: &Identifier) -> Result<Arc<DestinationSequence>> {
        self.endpoint
            .destination()
            .get_sequence(id)
            .ok_or_else(|| RmError::InvalidState(format!("no destination sequence {}", id)))
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            name: self.endpoint.name().to_string(),
            source_sequences: self.endpoint.source().len(),
            destination_sequences: self.endpoint.destination().len(),
            queued_outbound: self.queued_message_total(true),
            queued_inbound: self.queued_message_total(false),
            activity: self.endpoint.activity(),
            metrics: self.endpoint.metrics().snapshot(),
        }
    }

    /// Messages queued across this endpoint's sequences. `outbound` selects
    /// the retransmission queue, otherwise the redelivery queue.
    pub fn queued_message_total(&self, outbound: bool) -> usize {
        if outbound {
            let queue = self.endpoint.retransmission_queue();
            self.endpoint
                .source()
                .all_sequences()
                .iter()
                .map(|s| queue.count_unacknowledged(s.identifier()))
                .sum()
        } else {
            let queue = self.endpoint.redelivery_queue();
            self.endpoint
                .destination()
                .all_sequences()
                .iter()
                .map(|s| queue.count_undelivered(s.identifier()))
                .sum()
        }
    }

    pub fn queued_message_count(&self, id: &Identifier, outbound: bool) -> usize {
        if outbound {
            self.endpoint.retransmission_queue().count_unacknowledged(id)
        } else {
            self.endpoint.redelivery_queue().count_undelivered(id)
        }
    }

    pub fn unacknowledged_message_numbers(&self, id: &Identifier) -> Vec<u64> {
        self.endpoint.retransmission_queue().unacknowledged_numbers(id)
    }

    pub fn undelivered_message_numbers(&self, id: &Identifier) -> Vec<u64> {
        self.endpoint.redelivery_queue().undelivered_numbers(id)
    }

    pub fn deferred_acknowledgement_total(&self) -> usize {
        self.endpoint
            .destination()
            .all_sequences()
            .iter()
            .map(|s| s.deferred_acknowledgement_count())
            .sum()
    }

    pub fn deferred_acknowledgements(&self, id: &Identifier) -> Result<usize> {
        Ok(self.destination_sequence(id)?.deferred_acknowledgement_count())
    }

    pub fn source_sequence_acknowledged_range(&self, id: &Identifier) -> Result<Vec<u64>> {
        Ok(self.source_sequence(id)?.acknowledged_ranges().to_pairs())
    }

    pub fn destination_sequence_acknowledged_range(&self, id: &Identifier) -> Result<Vec<u64>> {
        Ok(self.destination_sequence(id)?.acknowledged_ranges().to_pairs())
    }

    pub fn retransmission_status(&self, id: &Identifier, number: u64) -> Result<RetryStatus> {
        self.endpoint
            .retransmission_queue()
            .retransmission_status(id, number)
            .ok_or_else(|| {
                RmError::InvalidState(format!("{}#{} is not awaiting retransmission", id, number))
            })
    }

    pub fn retransmission_statuses(&self, id: &Identifier) -> Result<Vec<RetryStatus>> {
        self.source_sequence(id)?;
        Ok(self.endpoint.retransmission_queue().retransmission_statuses(id))
    }

    pub fn redelivery_status(&self, id: &Identifier, number: u64) -> Result<RetryStatus> {
        self.endpoint
            .redelivery_queue()
            .redelivery_status(id, number)
            .ok_or_else(|| {
                RmError::InvalidState(format!("{}#{} is not awaiting redelivery", id, number))
            })
    }

    pub fn redelivery_statuses(&self, id: &Identifier) -> Result<Vec<RetryStatus>> {
        self.destination_sequence(id)?;
        Ok(self.endpoint.redelivery_queue().redelivery_statuses(id))
    }

    pub fn source_sequence_ids(&self, include_expired: bool) -> Vec<Identifier> {
        self.endpoint
            .source()
            .all_sequences()
            .iter()
            .filter(|s| include_expired || !s.is_expired())
            .map(|s| s.identifier().clone())
            .collect()
    }

    pub fn destination_sequence_ids(&self) -> Vec<Identifier> {
        self.endpoint
            .destination()
            .all_sequences()
            .iter()
            .map(|s| s.identifier().clone())
            .collect()
    }

    /// Sequence client-initiated messages currently go out on.
    pub fn current_source_sequence_id(&self) -> Option<Identifier> {
        self.endpoint
            .source()
            .current(None)
            .map(|s| s.identifier().clone())
    }

    pub fn source_sequence_info(&self, id: &Identifier) -> Result<SourceSequenceInfo> {
        Ok(self.describe_source(&*self.source_sequence(id)?))
    }

    pub fn source_sequences(&self, include_expired: bool) -> Vec<SourceSequenceInfo> {
        self.endpoint
            .source()
            .all_sequences()
            .iter()
            .filter(|s| include_expired || !s.is_expired())
            .map(|s| self.describe_source(s))
            .collect()
    }

    fn describe_source(&self, seq: &SourceSequence) -> SourceSequenceInfo {
        SourceSequenceInfo {
            identifier: seq.identifier().clone(),
            state: seq.state(),
            current_message_number: seq.current_message_number(),
            last_message: seq.is_last_message(),
            expires_ms: seq.expires().map(millis_since_epoch),
            offering_id: seq.offering_id().cloned(),
            target: seq.target().map(|t| t.address.clone()),
            queued: self.queued_message_count(seq.identifier(), true),
            acknowledged: seq.acknowledged_ranges().to_pairs(),
        }
    }

    pub fn destination_sequence_info(&self, id: &Identifier) -> Result<DestinationSequenceInfo> {
        Ok(self.describe_destination(&*self.destination_sequence(id)?))
    }

    pub fn destination_sequences(&self) -> Vec<DestinationSequenceInfo> {
        self.endpoint
            .destination()
            .all_sequences()
            .iter()
            .map(|s| self.describe_destination(s))
            .collect()
    }

    fn describe_destination(&self, seq: &DestinationSequence) -> DestinationSequenceInfo {
        DestinationSequenceInfo {
            identifier: seq.identifier().clone(),
            state: seq.state(),
            acks_to: seq.acks_to().address.clone(),
            last_message_number: seq.last_message_number(),
            acknowledged: seq.acknowledged_ranges().to_pairs(),
            ack_pending: seq.send_acknowledgement(),
            deferred_acknowledgements: seq.deferred_acknowledgement_count(),
            undelivered: self.queued_message_count(seq.identifier(), false),
        }
    }

    pub fn suspend_source_queue(&self, id: &Identifier) -> Result<()> {
        self.source_sequence(id)?;
        self.endpoint.retransmission_queue().suspend(id);
        Ok(())
    }

    pub fn resume_source_queue(&self, id: &Identifier) -> Result<()> {
        self.source_sequence(id)?;
        self.endpoint.retransmission_queue().resume(id);
        Ok(())
    }

    pub fn suspend_destination_queue(&self, id: &Identifier) -> Result<()> {
        self.destination_sequence(id)?;
        self.endpoint.redelivery_queue().suspend(id);
        Ok(())
    }

    pub fn resume_destination_queue(&self, id: &Identifier) -> Result<()> {
        self.destination_sequence(id)?;
        self.endpoint.redelivery_queue().resume(id);
        Ok(())
    }

    /// Stop numbering on a source sequence and notify the peer.
    pub fn close_source_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.source_sequence(id)?;
        seq.set_last_message();
        self.endpoint.close_source_sequence(&seq, false);
        Ok(())
    }

    pub fn terminate_source_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.source_sequence(id)?;
        self.endpoint.terminate_source_sequence(&seq);
        Ok(())
    }

    pub fn terminate_destination_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.destination_sequence(id)?;
        self.endpoint.discard_destination_sequence(&seq, false);
        Ok(())
    }

    /// Drop a source sequence. Refused while messages await acknowledgement.
    pub fn remove_source_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.source_sequence(id)?;
        let queued = self.queued_message_count(id, true);
        if queued > 0 {
            return Err(RmError::InvalidState(format!(
                "source sequence {} still has {} unacknowledged message(s)",
                id, queued
            )));
        }
        self.endpoint.discard_source_sequence(&seq, false);
        Ok(())
    }

    /// Drop a destination sequence. Refused while messages await redelivery.
    pub fn remove_destination_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.destination_sequence(id)?;
        let queued = self.queued_message_count(id, false);
        if queued > 0 {
            return Err(RmError::InvalidState(format!(
                "destination sequence {} still has {} undelivered message(s)",
                id, queued
            )));
        }
        self.endpoint.discard_destination_sequence(&seq, false);
        Ok(())
    }

    pub fn purge_unacknowledged_messages(&self, id: &Identifier) -> Result<Vec<u64>> {
        self.source_sequence(id)?;
        Ok(self.endpoint.retransmission_queue().purge_all(id))
    }

    pub fn purge_undelivered_messages(&self, id: &Identifier) -> Result<Vec<u64>> {
        self.destination_sequence(id)?;
        Ok(self.endpoint.redelivery_queue().purge_all(id))
    }
}
