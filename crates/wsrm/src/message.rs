// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message model seen by the sequence engine.
//!
//! The engine never parses SOAP. The binding layer maps wire headers onto
//! [`RmProperties`] and [`AddressingProperties`] and hands the engine anything
//! implementing [`MessageContext`].

use crate::ack_range::SequenceAcknowledgement;
use crate::config::WSA200408_NAMESPACE;
use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// WS-Addressing 2005/08 anonymous address.
pub const ANONYMOUS_ADDRESS: &str = "http://www.w3.org/2005/08/addressing/anonymous";
/// WS-Addressing 2004/08 anonymous role.
pub const ANONYMOUS_ADDRESS_200408: &str =
    "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
/// WS-Addressing "none" address.
pub const NONE_ADDRESS: &str = "http://www.w3.org/2005/08/addressing/none";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointReference {
    pub address: String,
}

impl EndpointReference {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_ADDRESS)
    }

    /// True for the back-channel address of either addressing version.
    pub fn is_anonymous(&self) -> bool {
        self.address == ANONYMOUS_ADDRESS || self.address == ANONYMOUS_ADDRESS_200408
    }

    pub fn is_none(&self) -> bool {
        self.address == NONE_ADDRESS
    }

    /// Anonymous address in the given addressing namespace.
    pub fn anonymous_for(addressing_namespace: &str) -> Self {
        if addressing_namespace == WSA200408_NAMESPACE {
            Self::new(ANONYMOUS_ADDRESS_200408)
        } else {
            Self::anonymous()
        }
    }
}

/// Contents of a `Sequence` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHeader {
    pub identifier: Identifier,
    pub message_number: u64,
    /// RM 1.0 `LastMessage` marker.
    #[serde(default)]
    pub last_message: bool,
}

/// Reliable messaging headers of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RmProperties {
    pub sequence: Option<SequenceHeader>,
    pub acknowledgements: Vec<SequenceAcknowledgement>,
    pub acks_requested: Vec<Identifier>,
    pub close_sequence: Option<Identifier>,
}

impl RmProperties {
    pub fn with_sequence(identifier: Identifier, message_number: u64) -> Self {
        Self {
            sequence: Some(SequenceHeader {
                identifier,
                message_number,
                last_message: false,
            }),
            ..Self::default()
        }
    }

    /// True when the message carries only control headers.
    pub fn is_control(&self) -> bool {
        self.sequence.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressingProperties {
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<EndpointReference>,
    pub relates_to: Option<String>,
}

/// Narrow view of a host message.
///
/// Only the accessors the engine needs; the binding layer implements this for
/// its own message type.
pub trait MessageContext {
    fn rm_properties(&self) -> &RmProperties;
    fn addressing(&self) -> &AddressingProperties;
    fn content(&self) -> &[u8];

    fn content_type(&self) -> Option<&str> {
        None
    }

    fn sequence_header(&self) -> Option<&SequenceHeader> {
        self.rm_properties().sequence.as_ref()
    }

    fn message_number(&self) -> Option<u64> {
        self.sequence_header().map(|h| h.message_number)
    }

    fn correlation_id(&self) -> Option<&str> {
        self.addressing().message_id.as_deref()
    }
}

/// Concrete message held by the retransmission and redelivery queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmMessage {
    pub rm: RmProperties,
    pub addressing: AddressingProperties,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
    pub created: SystemTime,
}

impl RmMessage {
    pub fn new(rm: RmProperties, content: Vec<u8>) -> Self {
        Self {
            rm,
            addressing: AddressingProperties::default(),
            content,
            content_type: None,
            created: SystemTime::now(),
        }
    }

    pub fn with_addressing(mut self, addressing: AddressingProperties) -> Self {
        self.addressing = addressing;
        self
    }

    /// Copy any context into an owned message.
    pub fn from_context(ctx: &dyn MessageContext) -> Self {
        Self {
            rm: ctx.rm_properties().clone(),
            addressing: ctx.addressing().clone(),
            content: ctx.content().to_vec(),
            content_type: ctx.content_type().map(str::to_owned),
            created: SystemTime::now(),
        }
    }

    /// Rebuild a message from its persisted form.
    pub fn from_stored(identifier: Identifier, stored: &StoredMessage) -> Self {
        let mut message = Self::new(
            RmProperties::with_sequence(identifier, stored.message_number),
            stored.content.clone(),
        );
        message.addressing.to = stored.to.clone();
        message.content_type = stored.content_type.clone();
        message.created = UNIX_EPOCH + std::time::Duration::from_millis(stored.created_ms);
        message
    }

    pub fn to_stored(&self) -> Option<StoredMessage> {
        let number = self.message_number()?;
        Some(StoredMessage {
            message_number: number,
            created_ms: millis_since_epoch(self.created),
            to: self.addressing.to.clone(),
            content_type: self.content_type.clone(),
            content: self.content.clone(),
        })
    }
}

impl MessageContext for RmMessage {
    fn rm_properties(&self) -> &RmProperties {
        &self.rm
    }

    fn addressing(&self) -> &AddressingProperties {
        &self.addressing
    }

    fn content(&self) -> &[u8] {
        &self.content
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Persisted copy of a numbered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_number: u64,
    pub created_ms: u64,
    pub to: Option<String>,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

pub(crate) fn millis_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_addresses() {
        assert!(EndpointReference::anonymous().is_anonymous());
        assert!(EndpointReference::new(ANONYMOUS_ADDRESS_200408).is_anonymous());
        assert!(!EndpointReference::new("http://peer:9000/rm").is_anonymous());
        assert!(EndpointReference::anonymous_for(WSA200408_NAMESPACE).is_anonymous());
    }

    #[test]
    fn test_stored_roundtrip_keeps_number_and_target() {
        let mut msg = RmMessage::new(
            RmProperties::with_sequence(Identifier::new("s1"), 7),
            b"payload".to_vec(),
        );
        msg.addressing.to = Some("http://peer/rm".into());

        let stored = msg.to_stored().unwrap();
        assert_eq!(stored.message_number, 7);

        let back = RmMessage::from_stored(Identifier::new("s1"), &stored);
        assert_eq!(back.message_number(), Some(7));
        assert_eq!(back.addressing.to.as_deref(), Some("http://peer/rm"));
        assert_eq!(back.content, b"payload");
    }

    #[test]
    fn test_control_message_has_no_number() {
        let msg = RmMessage::new(RmProperties::default(), Vec::new());
        assert!(msg.rm.is_control());
        assert!(msg.to_stored().is_none());
    }
}
