// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-sequence state machines.

pub mod destination;
pub mod source;

pub use destination::{
    AckOutcome, DeliveryPermit, DestinationOwner, DestinationSequence, DestinationState,
};
pub use source::{SourceSequence, SourceState};
