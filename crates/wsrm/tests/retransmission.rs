// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background resending driven by the manager's worker.

mod common;

use common::{ack_message, payload, target, wait_until, RecordingProxy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wsrm::{
    AckRange, AckRangeSet, MessageContext, RmConfiguration, RmManager, RmMessage,
    SequenceAcknowledgement,
};

#[test]
fn test_unacknowledged_messages_are_resent_until_acknowledged() {
    let config = RmConfiguration::builder()
        .base_retransmission_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let manager = RmManager::new(config).unwrap();
    let resent = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&resent);
    manager
        .start(
            Arc::new(move |m: &RmMessage| -> wsrm::Result<()> {
                sink.lock().push(m.message_number().unwrap_or_default());
                Ok(())
            }),
            Arc::new(|_: &RmMessage| -> wsrm::Result<()> { Ok(()) }),
        )
        .unwrap();
    assert!(manager.retransmission_queue().is_running());

    let client = manager.reliable_endpoint("client", RecordingProxy::new());
    let first = client.send_application_message(payload("a"), &target(), None).unwrap();
    client.send_application_message(payload("b"), &target(), None).unwrap();
    let id = first.sequence_header().unwrap().identifier.clone();

    assert!(wait_until(Duration::from_secs(2), || {
        let r = resent.lock();
        r.contains(&1) && r.contains(&2)
    }));

    client
        .process_acknowledgements(&ack_message(vec![SequenceAcknowledgement::new(
            id.clone(),
            AckRangeSet::from_ranges([AckRange::new(1, 1)]),
        )]))
        .unwrap();
    assert_eq!(client.retransmission_queue().unacknowledged_numbers(&id), vec![2]);

    resent.lock().clear();
    assert!(wait_until(Duration::from_secs(2), || resent.lock().contains(&2)));
    assert!(!resent.lock().contains(&1));
    assert!(manager.metrics().snapshot().retransmits_sent >= 3);

    manager.shutdown();
    assert!(!manager.retransmission_queue().is_running());
}

#[test]
fn test_retransmission_gives_up_after_max_attempts() {
    let config = RmConfiguration::builder()
        .base_retransmission_interval(Duration::from_millis(10))
        .max_retransmissions(2)
        .build()
        .unwrap();
    let manager = RmManager::new(config).unwrap();
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    manager
        .start(
            Arc::new(move |_: &RmMessage| -> wsrm::Result<()> {
                *counter.lock() += 1;
                Err(wsrm::RmError::Transport("peer unreachable".into()))
            }),
            Arc::new(|_: &RmMessage| -> wsrm::Result<()> { Ok(()) }),
        )
        .unwrap();

    let client = manager.reliable_endpoint("client", RecordingProxy::new());
    let sent = client.send_application_message(payload("a"), &target(), None).unwrap();
    let id = sent.sequence_header().unwrap().identifier.clone();

    assert!(wait_until(Duration::from_secs(2), || *attempts.lock() == 2));
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(*attempts.lock(), 2);

    let status = client
        .retransmission_queue()
        .retransmission_status(&id, 1)
        .unwrap();
    assert_eq!(status.attempts, 2);
    assert_eq!(status.max_attempts, Some(2));
    assert_eq!(manager.metrics().snapshot().retransmit_failures, 2);
}

#[test]
fn test_suspended_sequence_is_not_resent() {
    let config = RmConfiguration::builder()
        .base_retransmission_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    let manager = RmManager::new(config).unwrap();
    let resent = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&resent);

    let client = manager.reliable_endpoint("client", RecordingProxy::new());
    let sent = client.send_application_message(payload("a"), &target(), None).unwrap();
    let id = sent.sequence_header().unwrap().identifier.clone();
    client.retransmission_queue().suspend(&id);

    manager
        .start(
            Arc::new(move |_: &RmMessage| -> wsrm::Result<()> {
                *counter.lock() += 1;
                Ok(())
            }),
            Arc::new(|_: &RmMessage| -> wsrm::Result<()> { Ok(()) }),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(*resent.lock(), 0);

    client.retransmission_queue().resume(&id);
    assert!(wait_until(Duration::from_secs(2), || *resent.lock() > 0));
}
