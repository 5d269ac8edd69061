// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test helpers shared by the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use wsrm::{
    CreateSequenceRequest, CreateSequenceResponse, DestinationSequence, EndpointReference,
    Identifier, Proxy, Result, RmEndpoint, RmMessage, RmProperties, SequenceAcknowledgement,
    SourceSequence,
};

/// Proxy that records every protocol message instead of sending it.
///
/// With a peer set, `create_sequence` is answered by the peer endpoint as if
/// the request had crossed the wire.
#[derive(Default)]
pub struct RecordingProxy {
    peer: OnceLock<Arc<RmEndpoint>>,
    accept_offer: bool,
    next_id: AtomicU64,
    pub requests: Mutex<Vec<CreateSequenceRequest>>,
    pub acks: Mutex<Vec<SequenceAcknowledgement>>,
    pub last_messages: Mutex<Vec<Identifier>>,
    pub closes: Mutex<Vec<Identifier>>,
    pub terminates: Mutex<Vec<Identifier>>,
}

impl RecordingProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accepting_offers() -> Arc<Self> {
        Arc::new(Self {
            accept_offer: true,
            ..Self::default()
        })
    }

    pub fn connect(&self, peer: Arc<RmEndpoint>) {
        let _ = self.peer.set(peer);
    }

    pub fn last_ack(&self) -> Option<SequenceAcknowledgement> {
        self.acks.lock().last().cloned()
    }
}

impl Proxy for RecordingProxy {
    fn acknowledge(&self, sequence: &DestinationSequence) -> Result<()> {
        self.acks.lock().push(sequence.acknowledgement());
        Ok(())
    }

    fn last_message(&self, sequence: &SourceSequence) -> Result<()> {
        self.last_messages.lock().push(sequence.identifier().clone());
        Ok(())
    }

    fn close_sequence(&self, sequence: &SourceSequence) -> Result<()> {
        self.closes.lock().push(sequence.identifier().clone());
        Ok(())
    }

    fn terminate(&self, sequence: &SourceSequence) -> Result<()> {
        self.terminates.lock().push(sequence.identifier().clone());
        Ok(())
    }

    fn create_sequence(
        &self,
        _target: &EndpointReference,
        request: &CreateSequenceRequest,
    ) -> Result<CreateSequenceResponse> {
        self.requests.lock().push(request.clone());
        if let Some(peer) = self.peer.get() {
            return peer.create_sequence(request);
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(CreateSequenceResponse {
            identifier: Identifier::new(format!("seq-{}", n)),
            expires: request.expires,
            offer_accepted: self.accept_offer && request.offer.is_some(),
        })
    }
}

pub fn target() -> EndpointReference {
    EndpointReference::new("http://peer.example/service")
}

pub fn payload(text: &str) -> RmMessage {
    RmMessage::new(RmProperties::default(), text.as_bytes().to_vec())
}

/// Control message carrying `acks`, as received from the peer.
pub fn ack_message(acks: Vec<SequenceAcknowledgement>) -> RmMessage {
    RmMessage::new(
        RmProperties {
            acknowledgements: acks,
            ..RmProperties::default()
        },
        Vec::new(),
    )
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
