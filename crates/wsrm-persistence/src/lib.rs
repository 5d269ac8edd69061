// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable storage for the wsrm reliable messaging engine.
//!
//! Provides an [`RmStore`](wsrm::RmStore) backend that survives process
//! restarts, so an [`RmManager`](wsrm::RmManager) can recover unacknowledged
//! and undelivered messages with `recover_endpoint`.
//!
//! # Features
//!
//! - **SQLite Backend** -- Single-file storage, bundled libsqlite3
//! - **Atomic Updates** -- Sequence state and message copy written in one transaction
//! - **Operator CLI** -- `wsrm-store` inspects and purges a database file
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wsrm::{RmConfiguration, RmManager};
//! use wsrm_persistence::SqliteStore;
//!
//! let store = Arc::new(SqliteStore::new("wsrm.db")?);
//! let manager = RmManager::builder(RmConfiguration::default())
//!     .store(store)
//!     .build()?;
//! let client = manager.recover_endpoint("client", proxy)?;
//! ```

pub mod sqlite;

pub use sqlite::{SqliteStore, StoreStats};
