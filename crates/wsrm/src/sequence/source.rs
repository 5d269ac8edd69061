// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound sequence state.

use crate::ack_range::{AckRangeSet, SequenceAcknowledgement};
use crate::config::{ProtocolVariation, SequenceTerminationPolicy};
use crate::error::{Result, RmError};
use crate::identifier::Identifier;
use crate::message::{millis_since_epoch, EndpointReference};
use crate::retransmission::RetransmissionQueue;
use crate::store::SourceSequenceRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle of a [`SourceSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    Active,
    /// No further numbers will be assigned.
    LastMessageSet,
    /// Last message or close dispatched; waiting for the final acknowledgement.
    AwaitingFinalAck,
    Terminated,
}

#[derive(Debug)]
struct SourceInner {
    current: u64,
    last_message: bool,
    state: SourceState,
    acknowledged: AckRangeSet,
}

/// Sending side of a sequence.
///
/// Number assignment, policy evaluation and acknowledgement merging are
/// serialized by one mutex per sequence.
#[derive(Debug)]
pub struct SourceSequence {
    identifier: Identifier,
    protocol: ProtocolVariation,
    expires: Option<SystemTime>,
    offering_id: Identifier,
    target: Option<EndpointReference>,
    policy: SequenceTerminationPolicy,
    inner: Mutex<SourceInner>,
    retransmission: OnceLock<Arc<RetransmissionQueue>>,
}

impl SourceSequence {
    pub fn new(identifier: Identifier, protocol: ProtocolVariation) -> Self {
        Self {
            identifier,
            protocol,
            expires: None,
            offering_id: Identifier::none(),
            target: None,
            policy: SequenceTerminationPolicy::default(),
            inner: Mutex::new(SourceInner {
                current: 0,
                last_message: false,
                state: SourceState::Active,
                acknowledged: AckRangeSet::new(),
            }),
            retransmission: OnceLock::new(),
        }
    }

    pub fn with_expiry(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_lifetime(self, lifetime: Duration) -> Self {
        self.with_expiry(SystemTime::now() + lifetime)
    }

    /// Mark this sequence as offered while creating sequence `offering_id`.
    pub fn with_offering_id(mut self, offering_id: Identifier) -> Self {
        self.offering_id = offering_id;
        self
    }

    pub fn with_target(mut self, target: EndpointReference) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_termination_policy(mut self, policy: SequenceTerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Rebuild from a persisted record.
    pub fn from_record(record: &SourceSequenceRecord, policy: SequenceTerminationPolicy) -> Self {
        let mut seq = Self::new(record.identifier.clone(), record.protocol)
            .with_offering_id(record.offering_id.clone())
            .with_termination_policy(policy);
        seq.expires = record
            .expires_ms
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
        seq.target = record.target.clone();
        {
            let inner = seq.inner.get_mut();
            inner.current = record.current_message_number;
            if record.last_message {
                inner.last_message = true;
                inner.state = SourceState::LastMessageSet;
            }
        }
        seq
    }

    pub fn to_record(&self, endpoint: &str) -> SourceSequenceRecord {
        let inner = self.inner.lock();
        SourceSequenceRecord {
            identifier: self.identifier.clone(),
            endpoint: endpoint.to_string(),
            protocol: self.protocol,
            current_message_number: inner.current,
            last_message: inner.last_message,
            expires_ms: self.expires.map(millis_since_epoch),
            offering_id: self.offering_id.clone(),
            target: self.target.clone(),
        }
    }

    /// Route acknowledgement purges to `queue`. Only the first call has effect.
    pub fn attach_retransmission_queue(&self, queue: Arc<RetransmissionQueue>) {
        let _ = self.retransmission.set(queue);
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn protocol(&self) -> ProtocolVariation {
        self.protocol
    }

    pub fn target(&self) -> Option<&EndpointReference> {
        self.target.as_ref()
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn offering_id(&self) -> Option<&Identifier> {
        if self.offering_id.is_none() {
            None
        } else {
            Some(&self.offering_id)
        }
    }

    pub fn current_message_number(&self) -> u64 {
        self.inner.lock().current
    }

    pub fn is_last_message(&self) -> bool {
        self.inner.lock().last_message
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SourceState::Terminated
    }

    /// Assign the next message number.
    ///
    /// Reaching a termination policy threshold marks this number as the last
    /// one in the same call.
    pub fn next_message_number(&self) -> Result<u64> {
        self.assign_number(false)
    }

    /// Assign the next number and mark it as the last of the sequence.
    pub fn next_last_message_number(&self) -> Result<u64> {
        self.assign_number(true)
    }

    fn assign_number(&self, last: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.state == SourceState::Terminated {
            return Err(RmError::InvalidState(format!(
                "source sequence {} is terminated",
                self.identifier
            )));
        }
        if inner.last_message {
            return Err(RmError::InvalidState(format!(
                "source sequence {} already assigned its last message ({})",
                self.identifier, inner.current
            )));
        }

        inner.current += 1;
        let number = inner.current;
        if last || self.policy_threshold_reached(&inner) {
            inner.last_message = true;
            inner.state = SourceState::LastMessageSet;
            log::debug!(
                "[source] sequence {} reached its last message {}",
                self.identifier,
                number
            );
        }
        Ok(number)
    }

    fn policy_threshold_reached(&self, inner: &SourceInner) -> bool {
        let p = &self.policy;
        let number = inner.current;
        if p.max_length != 0 && number >= p.max_length {
            return true;
        }
        if p.max_ranges > 0 && inner.acknowledged.len() >= p.max_ranges {
            return true;
        }
        if p.max_unacknowledged > 0 {
            let sent = number - 1;
            let unacknowledged = sent - inner.acknowledged.acknowledged_within(sent);
            if unacknowledged >= p.max_unacknowledged {
                return true;
            }
        }
        false
    }

    /// Mark the sequence closed without assigning a number.
    pub fn set_last_message(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SourceState::Active {
            inner.last_message = true;
            inner.state = SourceState::LastMessageSet;
        }
    }

    /// Record that the last message (or a close) went out to the peer.
    pub fn mark_closing(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SourceState::Terminated {
            inner.last_message = true;
            inner.state = SourceState::AwaitingFinalAck;
        }
    }

    pub fn terminate(&self) {
        self.inner.lock().state = SourceState::Terminated;
    }

    /// Merge acknowledged ranges from the peer and purge the retransmission
    /// queue. Returns the message numbers purged from the queue.
    pub fn set_acknowledged(&self, ranges: &AckRangeSet) -> Result<Vec<u64>> {
        {
            let mut inner = self.inner.lock();
            if inner.state == SourceState::Terminated {
                return Err(RmError::InvalidState(format!(
                    "acknowledgement for terminated source sequence {}",
                    self.identifier
                )));
            }
            if ranges.highest().is_some_and(|h| h > inner.current) {
                log::warn!(
                    "[source] sequence {} acknowledged up to {:?} but only {} assigned",
                    self.identifier,
                    ranges.highest(),
                    inner.current
                );
            }
            inner.acknowledged.union(ranges);
        }

        Ok(match self.retransmission.get() {
            Some(queue) => queue.purge_acknowledged(self),
            None => Vec::new(),
        })
    }

    pub fn is_acknowledged(&self, number: u64) -> bool {
        self.inner.lock().acknowledged.contains(number)
    }

    pub fn acknowledged_ranges(&self) -> AckRangeSet {
        self.inner.lock().acknowledged.clone()
    }

    pub fn acknowledgement(&self) -> SequenceAcknowledgement {
        SequenceAcknowledgement::new(self.identifier.clone(), self.acknowledged_ranges())
    }

    /// Assigned numbers not yet acknowledged.
    pub fn unacknowledged_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner.current - inner.acknowledged.acknowledged_within(inner.current)
    }

    /// Last message assigned and every number up to it acknowledged.
    pub fn all_acknowledged(&self) -> bool {
        let inner = self.inner.lock();
        inner.last_message && inner.acknowledged.covers(1, inner.current)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|e| now >= e)
    }

    /// True if this sequence was offered while creating sequence `id`.
    pub fn offered_by(&self, id: &Identifier) -> bool {
        !self.offering_id.is_none() && self.offering_id == *id
    }
}
