// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the reliable messaging engine.
//!
//! Routine protocol outcomes (faults, duplicates) are ordinary `Err` values.
//! Callers match on [`RmError`] to decide whether a condition is peer-visible
//! ([`RmError::SequenceFault`]), local ([`RmError::Protocol`]) or just a message
//! to drop ([`RmError::DuplicateMessage`]).

use crate::config::ConfigError;
use crate::identifier::Identifier;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RmError>;

/// Peer-visible sequence fault categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceFaultKind {
    UnknownSequence,
    SequenceTerminated,
    LastMessageNumberExceeded,
}

impl fmt::Display for SequenceFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownSequence => "unknown sequence",
            Self::SequenceTerminated => "sequence terminated",
            Self::LastMessageNumberExceeded => "last message number exceeded",
        };
        f.write_str(s)
    }
}

/// A fault the binding layer translates into a wire fault for the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({identifier})")]
pub struct SequenceFault {
    pub kind: SequenceFaultKind,
    pub identifier: Identifier,
}

impl SequenceFault {
    pub fn unknown_sequence(identifier: Identifier) -> Self {
        Self {
            kind: SequenceFaultKind::UnknownSequence,
            identifier,
        }
    }

    pub fn terminated(identifier: Identifier) -> Self {
        Self {
            kind: SequenceFaultKind::SequenceTerminated,
            identifier,
        }
    }

    pub fn last_message_number_exceeded(identifier: Identifier) -> Self {
        Self {
            kind: SequenceFaultKind::LastMessageNumberExceeded,
            identifier,
        }
    }
}

#[derive(Debug, Error)]
pub enum RmError {
    #[error("sequence fault: {0}")]
    SequenceFault(#[from] SequenceFault),

    /// Malformed or missing RM/addressing metadata. Nothing was mutated.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("duplicate message {number} on sequence {sequence}")]
    DuplicateMessage { sequence: Identifier, number: u64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("in-order delivery of message {number} on sequence {sequence} timed out")]
    DeliveryTimeout { sequence: Identifier, number: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker or timer thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RmError {
    /// The fault kind, if this error is peer-visible.
    pub fn fault_kind(&self) -> Option<SequenceFaultKind> {
        match self {
            Self::SequenceFault(f) => Some(f.kind),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let err = RmError::from(SequenceFault::unknown_sequence(Identifier::new("s1")));
        assert_eq!(err.to_string(), "sequence fault: unknown sequence (s1)");
        assert_eq!(err.fault_kind(), Some(SequenceFaultKind::UnknownSequence));
    }

    #[test]
    fn test_duplicate_is_not_a_fault() {
        let err = RmError::DuplicateMessage {
            sequence: Identifier::new("s1"),
            number: 3,
        };
        assert!(err.is_duplicate());
        assert_eq!(err.fault_kind(), None);
    }
}
