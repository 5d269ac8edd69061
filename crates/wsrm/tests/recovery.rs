// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Restart of a manager on top of a populated store.

mod common;

use common::{ack_message, payload, target, wait_until, RecordingProxy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wsrm::{
    AckRange, AckRangeSet, Identifier, MemoryStore, MessageContext, RetryPolicy, RmConfiguration,
    RmManager, RmMessage, RmStore, SequenceAcknowledgement,
};

fn manager_with(store: &Arc<MemoryStore>, config: RmConfiguration) -> RmManager {
    RmManager::builder(config)
        .store(Arc::clone(store) as Arc<dyn RmStore>)
        .build()
        .unwrap()
}

#[test]
fn test_unacknowledged_messages_survive_restart() {
    let store = Arc::new(MemoryStore::new());
    let id = Identifier::new("seq-1");
    {
        let manager = manager_with(&store, RmConfiguration::default());
        let client = manager.reliable_endpoint("client", RecordingProxy::new());
        for text in ["a", "b", "c"] {
            client.send_application_message(payload(text), &target(), None).unwrap();
        }
        client
            .process_acknowledgements(&ack_message(vec![SequenceAcknowledgement::new(
                id.clone(),
                AckRangeSet::from_ranges([AckRange::new(1, 1)]),
            )]))
            .unwrap();
        assert_eq!(store.message_count(&id, true), 2);
    }

    let manager = manager_with(&store, RmConfiguration::default());
    let proxy = RecordingProxy::new();
    let client = manager.recover_endpoint("client", proxy.clone()).unwrap();

    let seq = client.source().get_sequence(&id).unwrap();
    assert_eq!(seq.current_message_number(), 3);
    assert_eq!(client.retransmission_queue().unacknowledged_numbers(&id), vec![2, 3]);
    let queued = client.retransmission_queue().unacknowledged_messages(&id);
    assert_eq!(queued[0].content, b"b".to_vec());
    assert_eq!(queued[0].addressing.to.as_deref(), Some(target().address.as_str()));

    let next = client.send_application_message(payload("d"), &target(), None).unwrap();
    let header = next.sequence_header().unwrap();
    assert_eq!(header.identifier, id);
    assert_eq!(header.message_number, 4);
    assert!(proxy.requests.lock().is_empty());
}

#[test]
fn test_undelivered_messages_are_redelivered_after_restart() {
    let store = Arc::new(MemoryStore::new());
    let mut config = RmConfiguration::default();
    config.destination_policy.retry = RetryPolicy {
        interval_ms: 20,
        exponential_backoff: false,
        max_retries: Some(5),
    };

    let id = {
        let manager = manager_with(&store, config.clone());
        let server = manager.reliable_endpoint("server", RecordingProxy::new());
        let client_proxy = RecordingProxy::new();
        client_proxy.connect(Arc::clone(&server));
        let client = manager.reliable_endpoint("client", client_proxy);

        let sent = client.send_application_message(payload("hello"), &target(), None).unwrap();
        let failed = server.deliver(&sent, |_: &dyn MessageContext| -> wsrm::Result<()> {
            Err(wsrm::RmError::Transport("consumer down".into()))
        });
        assert!(failed.is_err());
        sent.sequence_header().unwrap().identifier.clone()
    };
    assert_eq!(store.message_count(&id, false), 1);

    let manager = manager_with(&store, config);
    let server = manager.recover_endpoint("server", RecordingProxy::new()).unwrap();
    let dest = server.destination().get_sequence(&id).unwrap();
    assert_eq!(dest.acknowledged_ranges().to_pairs(), vec![1, 1]);
    assert_eq!(server.redelivery_queue().undelivered_numbers(&id), vec![1]);

    let redelivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&redelivered);
    manager
        .start(
            Arc::new(|_: &RmMessage| -> wsrm::Result<()> { Ok(()) }),
            Arc::new(move |m: &RmMessage| -> wsrm::Result<()> {
                sink.lock().push(m.content.clone());
                Ok(())
            }),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        store.message_count(&id, false) == 0
            && server.redelivery_queue().count_undelivered(&id) == 0
    }));
    assert_eq!(*redelivered.lock(), vec![b"hello".to_vec()]);
}

#[test]
fn test_recover_without_store_returns_fresh_endpoint() {
    let manager = RmManager::new(RmConfiguration::default()).unwrap();
    let endpoint = manager.recover_endpoint("client", RecordingProxy::new()).unwrap();
    assert!(endpoint.source().is_empty());
    assert!(endpoint.destination().is_empty());
}
