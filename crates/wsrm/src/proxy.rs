// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound protocol messages sent on behalf of the engine.
//!
//! The binding layer implements [`Proxy`] by building the corresponding SOAP
//! messages and handing them to its transport.

use crate::error::Result;
use crate::identifier::Identifier;
use crate::message::EndpointReference;
use crate::sequence::destination::DestinationSequence;
use crate::sequence::source::SourceSequence;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reciprocal sequence proposed inside a `CreateSequence` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub identifier: Identifier,
    pub expires: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequenceRequest {
    pub acks_to: EndpointReference,
    pub expires: Option<Duration>,
    pub offer: Option<Offer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequenceResponse {
    pub identifier: Identifier,
    pub expires: Option<Duration>,
    /// Set when the responder accepted the offered sequence.
    pub offer_accepted: bool,
}

pub trait Proxy: Send + Sync {
    /// Send a standalone `SequenceAcknowledgement` for `sequence`.
    fn acknowledge(&self, sequence: &DestinationSequence) -> Result<()>;

    fn ack_requested(&self, _sequence: &SourceSequence) -> Result<()> {
        Ok(())
    }

    /// Send an empty message flagged as the last of `sequence` (RM 1.0).
    fn last_message(&self, sequence: &SourceSequence) -> Result<()>;

    /// Send `CloseSequence` (RM 1.1). Defaults to the RM 1.0 equivalent.
    fn close_sequence(&self, sequence: &SourceSequence) -> Result<()> {
        self.last_message(sequence)
    }

    fn terminate(&self, sequence: &SourceSequence) -> Result<()>;

    fn create_sequence(
        &self,
        target: &EndpointReference,
        request: &CreateSequenceRequest,
    ) -> Result<CreateSequenceResponse>;
}
