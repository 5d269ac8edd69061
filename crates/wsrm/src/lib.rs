// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # wsrm - WS-ReliableMessaging sequence engine
//!
//! Sequence and acknowledgement bookkeeping for WS-ReliableMessaging 1.0 and
//! 1.1 endpoints. The crate never touches SOAP or a socket: a binding layer
//! maps wire headers onto [`MessageContext`] and implements [`Proxy`] to send
//! the protocol messages the engine asks for.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsrm::{EndpointReference, RmConfiguration, RmManager, RmMessage, Result};
//! # use wsrm::{Proxy, DestinationSequence, SourceSequence, CreateSequenceRequest, CreateSequenceResponse};
//! # struct MyProxy;
//! # impl Proxy for MyProxy {
//! #     fn acknowledge(&self, _: &DestinationSequence) -> Result<()> { Ok(()) }
//! #     fn last_message(&self, _: &SourceSequence) -> Result<()> { Ok(()) }
//! #     fn terminate(&self, _: &SourceSequence) -> Result<()> { Ok(()) }
//! #     fn create_sequence(&self, _: &EndpointReference, _: &CreateSequenceRequest)
//! #         -> Result<CreateSequenceResponse> { unimplemented!() }
//! # }
//!
//! fn main() -> Result<()> {
//!     let manager = RmManager::new(RmConfiguration::default())?;
//!     manager.start(
//!         Arc::new(|m: &RmMessage| -> Result<()> { /* put m back on the wire */ Ok(()) }),
//!         Arc::new(|_m: &RmMessage| -> Result<()> { Ok(()) }),
//!     )?;
//!
//!     let endpoint = manager.reliable_endpoint("greeter", Arc::new(MyProxy));
//!     let target = EndpointReference::new("http://peer/greeter");
//!     endpoint.send_application_message(RmMessage::new(Default::default(), b"hi".to_vec()), &target, None)?;
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! ```text
//! +---------------------------------------------------------------+
//! |  RmManager: endpoints by name, shared timer + queues + store  |
//! +---------------------------------------------------------------+
//! |  RmEndpoint: Source (outbound) | Destination (inbound)        |
//! +---------------------------------------------------------------+
//! |  SourceSequence | DestinationSequence | AckRangeSet           |
//! +---------------------------------------------------------------+
//! |  RetransmissionQueue | RedeliveryQueue | TimerService | Store |
//! +---------------------------------------------------------------+
//! ```

/// Acknowledgement ranges and `SequenceAcknowledgement`.
pub mod ack_range;
/// Endpoint configuration, policies and protocol variations.
pub mod config;
/// Reliable endpoint and its source/destination registries.
pub mod endpoint;
/// Error and fault types.
pub mod error;
/// Sequence identifiers and their generation.
pub mod identifier;
/// Operator view of an endpoint.
pub mod management;
/// Endpoint registry.
pub mod manager;
/// Engine-facing message model.
pub mod message;
/// Engine counters.
pub mod metrics;
/// Message rate monitor and application callbacks.
pub mod monitor;
/// Outbound protocol messages.
pub mod proxy;
/// Redelivery of inbound messages the application failed to take.
pub mod redelivery;
/// Retransmission of unacknowledged outbound messages.
pub mod retransmission;
mod retry;
/// Source and destination sequence state machines.
pub mod sequence;
/// Persistence interface and in-memory store.
pub mod store;
/// Single-thread deadline scheduler.
pub mod timer;

pub use ack_range::{AckRange, AckRangeSet, SequenceAcknowledgement};
pub use config::{
    AcksPolicy, ConfigError, DeliveryAssurance, DestinationPolicy, ProtocolVariation,
    RetryPolicy, RmConfiguration, SequenceTerminationPolicy, SourcePolicy,
};
pub use endpoint::{EndpointActivity, RmEndpoint};
pub use error::{Result, RmError, SequenceFault, SequenceFaultKind};
pub use identifier::{Identifier, IdentifierGenerator, UuidIdentifierGenerator};
pub use management::{DestinationSequenceInfo, EndpointInfo, ManagedEndpoint, SourceSequenceInfo};
pub use manager::{RmManager, RmManagerBuilder};
pub use message::{
    AddressingProperties, EndpointReference, MessageContext, RmMessage, RmProperties,
    SequenceHeader, StoredMessage,
};
pub use metrics::{RmMetrics, RmMetricsSnapshot};
pub use monitor::{MessageCallback, MessageCountingCallback, SequenceMonitor};
pub use proxy::{CreateSequenceRequest, CreateSequenceResponse, Offer, Proxy};
pub use redelivery::{RedeliveryQueue, Redeliverer};
pub use retransmission::{Resender, RetransmissionQueue};
pub use retry::RetryStatus;
pub use sequence::{
    AckOutcome, DeliveryPermit, DestinationOwner, DestinationSequence, DestinationState,
    SourceSequence, SourceState,
};
pub use store::{
    DestinationSequenceRecord, MemoryStore, RmStore, SourceSequenceRecord, StoreError,
};
pub use timer::{TimerHandle, TimerService};
