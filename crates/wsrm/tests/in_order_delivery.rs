// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery assurances observed end to end through two endpoints.

mod common;

use common::{ack_message, payload, target, RecordingProxy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wsrm::{
    DeliveryAssurance, MessageContext, RmConfiguration, RmEndpoint, RmManager, RmMessage,
};

fn pair(server_config: RmConfiguration) -> (RmManager, Arc<RmEndpoint>, Arc<RmEndpoint>) {
    let manager = RmManager::new(RmConfiguration::default()).unwrap();
    let server =
        manager.reliable_endpoint_with_config("server", server_config, RecordingProxy::new());
    let client_proxy = RecordingProxy::new();
    client_proxy.connect(Arc::clone(&server));
    let client = manager.reliable_endpoint("client", client_proxy);
    (manager, client, server)
}

fn send(client: &RmEndpoint, count: usize) -> Vec<RmMessage> {
    (1..=count)
        .map(|i| {
            client
                .send_application_message(payload(&format!("m{}", i)), &target(), None)
                .unwrap()
        })
        .collect()
}

#[test]
fn test_out_of_order_arrivals_are_delivered_in_order() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::ExactlyOnce)
        .in_order(true)
        .in_order_wait_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 5);

    let delivered = Mutex::new(Vec::new());
    std::thread::scope(|s| {
        let server = &server;
        let delivered = &delivered;
        for message in sent[1..].iter().rev() {
            s.spawn(move || {
                server
                    .deliver(message, |ctx: &dyn MessageContext| -> wsrm::Result<()> {
                        delivered.lock().push(ctx.message_number().unwrap());
                        Ok(())
                    })
                    .unwrap();
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        server
            .deliver(&sent[0], |ctx: &dyn MessageContext| -> wsrm::Result<()> {
                delivered.lock().push(ctx.message_number().unwrap());
                Ok(())
            })
            .unwrap();
    });
    assert_eq!(*delivered.lock(), vec![1, 2, 3, 4, 5]);

    let err = server
        .deliver(&sent[2], |_: &dyn MessageContext| -> wsrm::Result<()> {
            panic!("duplicate must not reach the application")
        })
        .unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(server.metrics().snapshot().duplicates_dropped, 1);

    let dest = server.destination().all_sequences().remove(0);
    assert_eq!(dest.acknowledged_ranges().to_pairs(), vec![1, 5]);
    client
        .process_acknowledgements(&ack_message(vec![dest.acknowledgement()]))
        .unwrap();
    assert!(client.retransmission_queue().is_empty());
}

#[test]
fn test_at_most_once_in_order_skips_missing_messages() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::AtMostOnce)
        .in_order(true)
        .build()
        .unwrap();
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 3);

    let delivered = Mutex::new(Vec::new());
    let record = |ctx: &dyn MessageContext| -> wsrm::Result<()> {
        delivered.lock().push(ctx.message_number().unwrap());
        Ok(())
    };
    server.deliver(&sent[0], record).unwrap();
    server.deliver(&sent[2], record).unwrap();
    let late = server.deliver(&sent[1], record).unwrap_err();
    assert!(late.is_duplicate());
    assert_eq!(*delivered.lock(), vec![1, 3]);
}

#[test]
fn test_at_least_once_redelivers_to_application() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::AtLeastOnce)
        .build()
        .unwrap();
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 1);

    let mut calls = 0;
    for _ in 0..2 {
        server
            .deliver(&sent[0], |_: &dyn MessageContext| -> wsrm::Result<()> {
                calls += 1;
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(calls, 2);
    let dest = server.destination().all_sequences().remove(0);
    assert_eq!(dest.acknowledged_ranges().to_pairs(), vec![1, 1]);
}

#[test]
fn test_at_least_once_in_order_rejects_completed_number() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::AtLeastOnce)
        .in_order(true)
        .in_order_wait_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 1);

    let mut calls = 0;
    server
        .deliver(&sent[0], |_: &dyn MessageContext| -> wsrm::Result<()> {
            calls += 1;
            Ok(())
        })
        .unwrap();
    let err = server
        .deliver(&sent[0], |_: &dyn MessageContext| -> wsrm::Result<()> {
            calls += 1;
            Ok(())
        })
        .unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(calls, 1);
}

#[test]
fn test_in_order_wait_times_out_behind_missing_predecessor() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::ExactlyOnce)
        .in_order(true)
        .in_order_wait_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 2);

    let err = server
        .deliver(&sent[1], |_: &dyn MessageContext| -> wsrm::Result<()> {
            panic!("must wait for message 1")
        })
        .unwrap_err();
    assert!(matches!(err, wsrm::RmError::DeliveryTimeout { number: 2, .. }));
}

#[test]
fn test_endpoint_shutdown_releases_waiting_delivery() {
    let config = RmConfiguration::builder()
        .delivery_assurance(DeliveryAssurance::ExactlyOnce)
        .in_order(true)
        .in_order_wait_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    let (manager, client, server) = pair(config);
    let sent = send(&client, 2);

    let started = std::time::Instant::now();
    let result = std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            server.deliver(&sent[1], |_: &dyn MessageContext| -> wsrm::Result<()> {
                panic!("must not be delivered after shutdown")
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(manager.shutdown_endpoint("server"));
        waiter.join().unwrap()
    });
    assert!(matches!(result, Err(wsrm::RmError::InvalidState(_))));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_failed_delivery_is_queued_for_redelivery() {
    let mut config = RmConfiguration::default();
    config.destination_policy.retry.max_retries = Some(3);
    let (_manager, client, server) = pair(config);
    let sent = send(&client, 1);

    let err = server
        .deliver(&sent[0], |_: &dyn MessageContext| -> wsrm::Result<()> {
            Err(wsrm::RmError::Transport("application unavailable".into()))
        })
        .unwrap_err();
    assert!(matches!(err, wsrm::RmError::Transport(_)));

    let id = sent[0].sequence_header().unwrap().identifier.clone();
    assert_eq!(server.redelivery_queue().undelivered_numbers(&id), vec![1]);
}
