// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence identifiers and their generation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token naming a sequence.
///
/// Equality is plain case-sensitive string equality. Two absent identifiers
/// compare equal; an absent identifier never equals a present one. Both rules
/// fall out of comparing the inner `Option<String>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Option<String>);

impl Identifier {
    /// Create an identifier from its string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    /// The absent identifier.
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(v) => f.write_str(v),
            None => f.write_str("<none>"),
        }
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Source of fresh sequence identifiers.
pub trait IdentifierGenerator: Send + Sync {
    fn generate(&self) -> Identifier;
}

/// Generates `urn:uuid:` identifiers from random (v4) UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdentifierGenerator;

impl IdentifierGenerator for UuidIdentifierGenerator {
    fn generate(&self) -> Identifier {
        Identifier::new(format!("urn:uuid:{}", uuid::Uuid::new_v4()))
    }
}
