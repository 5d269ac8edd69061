// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistence interface for sequences and message copies.
//!
//! The engine writes through a store when one is configured and reads it back
//! only during recovery. In-memory state is authoritative: store failures are
//! logged and never roll back a sequence mutation.

use crate::ack_range::AckRangeSet;
use crate::config::ProtocolVariation;
use crate::identifier::Identifier;
use crate::message::{EndpointReference, StoredMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sequence {0} not found in store")]
    NotFound(Identifier),
}

/// Persisted state of an outbound sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSequenceRecord {
    pub identifier: Identifier,
    pub endpoint: String,
    pub protocol: ProtocolVariation,
    pub current_message_number: u64,
    pub last_message: bool,
    pub expires_ms: Option<u64>,
    pub offering_id: Identifier,
    pub target: Option<EndpointReference>,
}

/// Persisted state of an inbound sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSequenceRecord {
    pub identifier: Identifier,
    pub endpoint: String,
    pub protocol: ProtocolVariation,
    pub acks_to: EndpointReference,
    pub last_message_number: u64,
    pub acknowledged: AckRangeSet,
    /// `CloseSequence` was received.
    #[serde(default)]
    pub closed: bool,
    pub terminated: bool,
}

/// Store consumed by the engine.
///
/// `outbound` selects the message table: `true` for copies kept for
/// retransmission, `false` for received copies kept for redelivery.
pub trait RmStore: Send + Sync {
    fn create_source_sequence(&self, record: &SourceSequenceRecord) -> Result<(), StoreError>;

    fn create_destination_sequence(
        &self,
        record: &DestinationSequenceRecord,
    ) -> Result<(), StoreError>;

    fn get_source_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<SourceSequenceRecord>, StoreError>;

    fn get_destination_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<DestinationSequenceRecord>, StoreError>;

    /// Remove the sequence and its outbound messages.
    fn remove_source_sequence(&self, id: &Identifier) -> Result<(), StoreError>;

    /// Remove the sequence and its inbound messages.
    fn remove_destination_sequence(&self, id: &Identifier) -> Result<(), StoreError>;

    fn get_source_sequences(&self, endpoint: &str) -> Result<Vec<SourceSequenceRecord>, StoreError>;

    fn get_destination_sequences(
        &self,
        endpoint: &str,
    ) -> Result<Vec<DestinationSequenceRecord>, StoreError>;

    /// Messages of one sequence, ascending by number.
    fn get_messages(&self, id: &Identifier, outbound: bool)
        -> Result<Vec<StoredMessage>, StoreError>;

    fn remove_messages(
        &self,
        id: &Identifier,
        numbers: &[u64],
        outbound: bool,
    ) -> Result<(), StoreError>;

    /// Update an inbound sequence and optionally store a received message.
    fn persist_incoming(
        &self,
        record: &DestinationSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError>;

    /// Update an outbound sequence and optionally store a sent message.
    fn persist_outgoing(
        &self,
        record: &SourceSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError>;
}

/// Log a store failure and carry on.
pub(crate) fn log_failure<T>(operation: &str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("[store] {} failed: {}", operation, e);
            None
        }
    }
}

#[derive(Default)]
struct MemoryState {
    sources: HashMap<Identifier, SourceSequenceRecord>,
    destinations: HashMap<Identifier, DestinationSequenceRecord>,
    outbound: HashMap<Identifier, BTreeMap<u64, StoredMessage>>,
    inbound: HashMap<Identifier, BTreeMap<u64, StoredMessage>>,
}

impl MemoryState {
    fn messages(&mut self, outbound: bool) -> &mut HashMap<Identifier, BTreeMap<u64, StoredMessage>> {
        if outbound {
            &mut self.outbound
        } else {
            &mut self.inbound
        }
    }
}

/// Process-local store, mainly for tests and recovery drills.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self, id: &Identifier, outbound: bool) -> usize {
        self.state
            .lock()
            .messages(outbound)
            .get(id)
            .map_or(0, BTreeMap::len)
    }
}

impl RmStore for MemoryStore {
    fn create_source_sequence(&self, record: &SourceSequenceRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .sources
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn create_destination_sequence(
        &self,
        record: &DestinationSequenceRecord,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .destinations
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn get_source_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<SourceSequenceRecord>, StoreError> {
        Ok(self.state.lock().sources.get(id).cloned())
    }

    fn get_destination_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<DestinationSequenceRecord>, StoreError> {
        Ok(self.state.lock().destinations.get(id).cloned())
    }

    fn remove_source_sequence(&self, id: &Identifier) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.sources.remove(id);
        state.outbound.remove(id);
        Ok(())
    }

    fn remove_destination_sequence(&self, id: &Identifier) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.destinations.remove(id);
        state.inbound.remove(id);
        Ok(())
    }

    fn get_source_sequences(&self, endpoint: &str) -> Result<Vec<SourceSequenceRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state
            .lock()
            .sources
            .values()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }

    fn get_destination_sequences(
        &self,
        endpoint: &str,
    ) -> Result<Vec<DestinationSequenceRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state
            .lock()
            .destinations
            .values()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }

    fn get_messages(
        &self,
        id: &Identifier,
        outbound: bool,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .state
            .lock()
            .messages(outbound)
            .get(id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_messages(
        &self,
        id: &Identifier,
        numbers: &[u64],
        outbound: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(messages) = state.messages(outbound).get_mut(id) {
            for n in numbers {
                messages.remove(n);
            }
        }
        Ok(())
    }

    fn persist_incoming(
        &self,
        record: &DestinationSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .destinations
            .insert(record.identifier.clone(), record.clone());
        if let Some(m) = message {
            state
                .inbound
                .entry(record.identifier.clone())
                .or_default()
                .insert(m.message_number, m.clone());
        }
        Ok(())
    }

    fn persist_outgoing(
        &self,
        record: &SourceSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.sources.insert(record.identifier.clone(), record.clone());
        if let Some(m) = message {
            state
                .outbound
                .entry(record.identifier.clone())
                .or_default()
                .insert(m.message_number, m.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u64) -> StoredMessage {
        StoredMessage {
            message_number: n,
            created_ms: 0,
            to: None,
            content_type: None,
            content: vec![n as u8],
        }
    }

    fn source(id: &str) -> SourceSequenceRecord {
        SourceSequenceRecord {
            identifier: Identifier::new(id),
            endpoint: "ep".into(),
            protocol: ProtocolVariation::default(),
            current_message_number: 0,
            last_message: false,
            expires_ms: None,
            offering_id: Identifier::none(),
            target: None,
        }
    }

    #[test]
    fn test_outgoing_messages_are_kept_per_sequence() {
        let store = MemoryStore::new();
        let mut rec = source("s1");
        for n in 1..=3 {
            rec.current_message_number = n;
            store.persist_outgoing(&rec, Some(&message(n))).unwrap();
        }
        assert_eq!(store.message_count(&rec.identifier, true), 3);
        assert_eq!(store.message_count(&rec.identifier, false), 0);

        store.remove_messages(&rec.identifier, &[1, 3], true).unwrap();
        let left = store.get_messages(&rec.identifier, true).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message_number, 2);

        let stored = store.get_source_sequence(&rec.identifier).unwrap().unwrap();
        assert_eq!(stored.current_message_number, 3);
    }

    #[test]
    fn test_remove_sequence_drops_messages() {
        let store = MemoryStore::new();
        let rec = source("s1");
        store.persist_outgoing(&rec, Some(&message(1))).unwrap();
        store.remove_source_sequence(&rec.identifier).unwrap();
        assert!(store.get_source_sequences("ep").unwrap().is_empty());
        assert_eq!(store.message_count(&rec.identifier, true), 0);
    }

    #[test]
    fn test_log_failure_swallows() {
        let r: Result<(), StoreError> = Err(StoreError::Backend("disk full".into()));
        assert!(log_failure("persist", r).is_none());
        assert_eq!(log_failure("persist", Ok(5)), Some(5));
    }
}
