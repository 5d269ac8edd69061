// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound sequences of one endpoint.

use crate::error::Result;
use crate::identifier::Identifier;
use crate::sequence::source::SourceSequence;
use crate::store::{log_failure, RmStore};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of source sequences.
///
/// `current` maps an inbound sequence id (absent for client-initiated
/// traffic) to the sequence new messages go out on.
pub struct Source {
    endpoint: String,
    sequences: DashMap<Identifier, Arc<SourceSequence>>,
    current: Mutex<HashMap<Identifier, Arc<SourceSequence>>>,
    store: Option<Arc<dyn RmStore>>,
}

impl Source {
    pub(crate) fn new(endpoint: impl Into<String>, store: Option<Arc<dyn RmStore>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sequences: DashMap::new(),
            current: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn get_sequence(&self, id: &Identifier) -> Option<Arc<SourceSequence>> {
        self.sequences.get(id).map(|s| Arc::clone(&s))
    }

    pub fn all_sequences(&self) -> Vec<Arc<SourceSequence>> {
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

    /// Register a sequence, optionally writing it to the store.
    pub(crate) fn add_sequence(&self, seq: Arc<SourceSequence>, persist: bool) {
        if persist {
            if let Some(store) = &self.store {
                log_failure(
                    "create_source_sequence",
                    store.create_source_sequence(&seq.to_record(&self.endpoint)),
                );
            }
        }
        log::debug!("[source:{}] added sequence {}", self.endpoint, seq.identifier());
        self.sequences.insert(seq.identifier().clone(), seq);
    }

    pub(crate) fn remove_sequence(&self, id: &Identifier) -> Option<Arc<SourceSequence>> {
        let removed = self.sequences.remove(id).map(|(_, s)| s);
        self.current.lock().retain(|_, s| s.identifier() != id);
        if let Some(store) = &self.store {
            log_failure("remove_source_sequence", store.remove_source_sequence(id));
        }
        removed
    }

    /// Sequence currently used for messages related to `in_seq`.
    pub fn current(&self, in_seq: Option<&Identifier>) -> Option<Arc<SourceSequence>> {
        let key = in_seq.cloned().unwrap_or_default();
        self.current.lock().get(&key).cloned()
    }

    pub(crate) fn set_current(&self, in_seq: Option<&Identifier>, seq: Arc<SourceSequence>) {
        let key = in_seq.cloned().unwrap_or_default();
        self.current.lock().insert(key, seq);
    }

    /// Current usable sequence for `in_seq`, created with `create` if there
    /// is none.
    ///
    /// Concurrent callers wait for a single creation.
    pub fn sequence_for<F>(
        &self,
        in_seq: Option<&Identifier>,
        create: F,
    ) -> Result<Arc<SourceSequence>>
    where
        F: FnOnce() -> Result<Arc<SourceSequence>>,
    {
        let key = in_seq.cloned().unwrap_or_default();
        let mut current = self.current.lock();
        if let Some(seq) = current.get(&key) {
            if Self::usable(seq) {
                return Ok(Arc::clone(seq));
            }
        }
        let seq = create()?;
        current.insert(key, Arc::clone(&seq));
        Ok(seq)
    }

    fn usable(seq: &SourceSequence) -> bool {
        !seq.is_last_message() && !seq.is_terminated() && !seq.is_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolVariation;
    use crate::store::MemoryStore;

    fn seq(id: &str) -> Arc<SourceSequence> {
        Arc::new(SourceSequence::new(Identifier::new(id), ProtocolVariation::default()))
    }

    #[test]
    fn test_sequence_for_reuses_current() {
        let source = Source::new("ep", None);
        let first = source
            .sequence_for(None, || {
                let s = seq("s1");
                source.add_sequence(Arc::clone(&s), false);
                Ok(s)
            })
            .unwrap();
        let again = source
            .sequence_for(None, || panic!("must reuse current sequence"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_closed_sequence_is_replaced() {
        let source = Source::new("ep", None);
        let first = source.sequence_for(None, || Ok(seq("s1"))).unwrap();
        first.next_last_message_number().unwrap();
        let second = source.sequence_for(None, || Ok(seq("s2"))).unwrap();
        assert_eq!(second.identifier(), &Identifier::new("s2"));
    }

    #[test]
    fn test_current_is_keyed_by_inbound_sequence() {
        let source = Source::new("ep", None);
        let offered = seq("offered");
        source.set_current(Some(&Identifier::new("in-1")), Arc::clone(&offered));
        assert!(source.current(None).is_none());
        let found = source.current(Some(&Identifier::new("in-1"))).unwrap();
        assert!(Arc::ptr_eq(&found, &offered));
    }

    #[test]
    fn test_add_and_remove_write_through() {
        let store = Arc::new(MemoryStore::new());
        let source = Source::new("ep", Some(store.clone() as Arc<dyn RmStore>));
        let s = seq("s1");
        source.add_sequence(Arc::clone(&s), true);
        source.set_current(None, Arc::clone(&s));
        assert_eq!(store.get_source_sequences("ep").unwrap().len(), 1);

        assert!(source.remove_sequence(s.identifier()).is_some());
        assert!(source.current(None).is_none());
        assert!(store.get_source_sequences("ep").unwrap().is_empty());
        assert!(source.is_empty());
    }
}
