// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite persistence backend
//!
//! Durable sequence and message store for reliable endpoints.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use wsrm::{
    DestinationSequenceRecord, Identifier, RmStore, SourceSequenceRecord, StoreError,
    StoredMessage,
};

/// Row counts of every table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub source_sequences: usize,
    pub destination_sequences: usize,
    pub outbound_messages: usize,
    pub inbound_messages: usize,
}

/// SQLite persistence store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE source_sequences (
///     id TEXT PRIMARY KEY,
///     endpoint TEXT NOT NULL,
///     protocol TEXT NOT NULL,
///     current_message_number INTEGER NOT NULL,
///     last_message INTEGER NOT NULL,
///     expires_ms INTEGER,
///     offering_id TEXT,
///     target TEXT
/// );
/// CREATE TABLE destination_sequences (
///     id TEXT PRIMARY KEY,
///     endpoint TEXT NOT NULL,
///     protocol TEXT NOT NULL,
///     acks_to TEXT NOT NULL,
///     last_message_number INTEGER NOT NULL,
///     acknowledged TEXT NOT NULL,     -- JSON ranges
///     closed INTEGER NOT NULL,
///     terminated INTEGER NOT NULL
/// );
/// CREATE TABLE outbound_messages / inbound_messages (
///     sequence_id TEXT NOT NULL,
///     message_number INTEGER NOT NULL,
///     created_ms INTEGER NOT NULL,
///     to_address TEXT,
///     content_type TEXT,
///     content BLOB NOT NULL,
///     PRIMARY KEY (sequence_id, message_number)
/// );
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-based store.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS source_sequences (
                id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                protocol TEXT NOT NULL,
                current_message_number INTEGER NOT NULL,
                last_message INTEGER NOT NULL,
                expires_ms INTEGER,
                offering_id TEXT,
                target TEXT
            );
            CREATE TABLE IF NOT EXISTS destination_sequences (
                id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                protocol TEXT NOT NULL,
                acks_to TEXT NOT NULL,
                last_message_number INTEGER NOT NULL,
                acknowledged TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                terminated INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS outbound_messages (
                sequence_id TEXT NOT NULL,
                message_number INTEGER NOT NULL,
                created_ms INTEGER NOT NULL,
                to_address TEXT,
                content_type TEXT,
                content BLOB NOT NULL,
                PRIMARY KEY (sequence_id, message_number)
            );
            CREATE TABLE IF NOT EXISTS inbound_messages (
                sequence_id TEXT NOT NULL,
                message_number INTEGER NOT NULL,
                created_ms INTEGER NOT NULL,
                to_address TEXT,
                content_type TEXT,
                content BLOB NOT NULL,
                PRIMARY KEY (sequence_id, message_number)
            );
            CREATE INDEX IF NOT EXISTS idx_source_endpoint ON source_sequences(endpoint);
            CREATE INDEX IF NOT EXISTS idx_destination_endpoint ON destination_sequences(endpoint);",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    fn table(outbound: bool) -> &'static str {
        if outbound {
            "outbound_messages"
        } else {
            "inbound_messages"
        }
    }

    /// Endpoint names that own at least one sequence.
    pub fn endpoints(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT endpoint FROM source_sequences
             UNION SELECT endpoint FROM destination_sequences
             ORDER BY endpoint",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn message_count(&self, id: &Identifier, outbound: bool) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE sequence_id = ?1",
                Self::table(outbound)
            ),
            [key(id)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |table: &str| -> Result<usize> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            Ok(n as usize)
        };
        Ok(StoreStats {
            source_sequences: count("source_sequences")?,
            destination_sequences: count("destination_sequences")?,
            outbound_messages: count("outbound_messages")?,
            inbound_messages: count("inbound_messages")?,
        })
    }

    /// Delete every sequence of `endpoint` with its messages.
    ///
    /// Returns the number of sequences removed.
    pub fn purge_endpoint(&self, endpoint: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM outbound_messages WHERE sequence_id IN
                (SELECT id FROM source_sequences WHERE endpoint = ?1)",
            [endpoint],
        )?;
        tx.execute(
            "DELETE FROM inbound_messages WHERE sequence_id IN
                (SELECT id FROM destination_sequences WHERE endpoint = ?1)",
            [endpoint],
        )?;
        let sources = tx.execute("DELETE FROM source_sequences WHERE endpoint = ?1", [endpoint])?;
        let destinations =
            tx.execute("DELETE FROM destination_sequences WHERE endpoint = ?1", [endpoint])?;
        tx.commit()?;
        tracing::info!(
            "purged endpoint {}: {} source / {} destination sequence(s)",
            endpoint,
            sources,
            destinations
        );
        Ok(sources + destinations)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM outbound_messages;
             DELETE FROM inbound_messages;
             DELETE FROM source_sequences;
             DELETE FROM destination_sequences;",
        )?;
        Ok(())
    }

    fn write_source(conn: &Connection, record: &SourceSequenceRecord) -> Result<()> {
        let target = record
            .target
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT OR REPLACE INTO source_sequences
             (id, endpoint, protocol, current_message_number, last_message, expires_ms, offering_id, target)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key(&record.identifier),
                record.endpoint,
                serde_json::to_string(&record.protocol)?,
                record.current_message_number as i64,
                record.last_message,
                record.expires_ms.map(|ms| ms as i64),
                record.offering_id.value(),
                target,
            ],
        )?;
        Ok(())
    }

    fn write_destination(conn: &Connection, record: &DestinationSequenceRecord) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO destination_sequences
             (id, endpoint, protocol, acks_to, last_message_number, acknowledged, closed, terminated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key(&record.identifier),
                record.endpoint,
                serde_json::to_string(&record.protocol)?,
                serde_json::to_string(&record.acks_to)?,
                record.last_message_number as i64,
                serde_json::to_string(&record.acknowledged)?,
                record.closed,
                record.terminated,
            ],
        )?;
        Ok(())
    }

    fn write_message(
        conn: &Connection,
        id: &Identifier,
        message: &StoredMessage,
        outbound: bool,
    ) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}
                 (sequence_id, message_number, created_ms, to_address, content_type, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                Self::table(outbound)
            ),
            params![
                key(id),
                message.message_number as i64,
                message.created_ms as i64,
                message.to,
                message.content_type,
                message.content,
            ],
        )?;
        Ok(())
    }

    fn row_to_source(row: &Row) -> rusqlite::Result<SourceSequenceRecord> {
        let target: Option<String> = row.get(7)?;
        Ok(SourceSequenceRecord {
            identifier: Identifier::new(row.get::<_, String>(0)?),
            endpoint: row.get(1)?,
            protocol: from_json(2, &row.get::<_, String>(2)?)?,
            current_message_number: row.get::<_, i64>(3)? as u64,
            last_message: row.get(4)?,
            expires_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms as u64),
            offering_id: row
                .get::<_, Option<String>>(6)?
                .map_or_else(Identifier::none, Identifier::new),
            target: target.map(|t| from_json(7, &t)).transpose()?,
        })
    }

    fn row_to_destination(row: &Row) -> rusqlite::Result<DestinationSequenceRecord> {
        let mut acknowledged: wsrm::AckRangeSet = from_json(5, &row.get::<_, String>(5)?)?;
        acknowledged.merge();
        Ok(DestinationSequenceRecord {
            identifier: Identifier::new(row.get::<_, String>(0)?),
            endpoint: row.get(1)?,
            protocol: from_json(2, &row.get::<_, String>(2)?)?,
            acks_to: from_json(3, &row.get::<_, String>(3)?)?,
            last_message_number: row.get::<_, i64>(4)? as u64,
            acknowledged,
            closed: row.get(6)?,
            terminated: row.get(7)?,
        })
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            message_number: row.get::<_, i64>(0)? as u64,
            created_ms: row.get::<_, i64>(1)? as u64,
            to: row.get(2)?,
            content_type: row.get(3)?,
            content: row.get(4)?,
        })
    }

    fn try_get_source(&self, id: &Identifier) -> Result<Option<SourceSequenceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{} WHERE id = ?1", SOURCE_COLUMNS),
                [key(id)],
                Self::row_to_source,
            )
            .optional()?;
        Ok(record)
    }

    fn try_get_destination(&self, id: &Identifier) -> Result<Option<DestinationSequenceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{} WHERE id = ?1", DESTINATION_COLUMNS),
                [key(id)],
                Self::row_to_destination,
            )
            .optional()?;
        Ok(record)
    }

    /// Source sequences of `endpoint`, or of every endpoint when `None`.
    pub fn source_sequences(&self, endpoint: Option<&str>) -> Result<Vec<SourceSequenceRecord>> {
        let conn = self.conn.lock();
        let records = match endpoint {
            Some(endpoint) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE endpoint = ?1 ORDER BY id", SOURCE_COLUMNS))?;
                let rows = stmt.query_map([endpoint], Self::row_to_source)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY endpoint, id", SOURCE_COLUMNS))?;
                let rows = stmt.query_map([], Self::row_to_source)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// Destination sequences of `endpoint`, or of every endpoint when `None`.
    pub fn destination_sequences(
        &self,
        endpoint: Option<&str>,
    ) -> Result<Vec<DestinationSequenceRecord>> {
        let conn = self.conn.lock();
        let records = match endpoint {
            Some(endpoint) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE endpoint = ?1 ORDER BY id", DESTINATION_COLUMNS))?;
                let rows = stmt.query_map([endpoint], Self::row_to_destination)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY endpoint, id", DESTINATION_COLUMNS))?;
                let rows = stmt.query_map([], Self::row_to_destination)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    pub fn messages(&self, id: &Identifier, outbound: bool) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT message_number, created_ms, to_address, content_type, content
             FROM {} WHERE sequence_id = ?1 ORDER BY message_number ASC",
            Self::table(outbound)
        ))?;
        let messages = stmt
            .query_map([key(id)], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn try_remove_sequence(&self, id: &Identifier, outbound: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let table = if outbound {
            "source_sequences"
        } else {
            "destination_sequences"
        };
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [key(id)])?;
        tx.execute(
            &format!("DELETE FROM {} WHERE sequence_id = ?1", Self::table(outbound)),
            [key(id)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn try_remove_messages(&self, id: &Identifier, numbers: &[u64], outbound: bool) -> Result<()> {
        if numbers.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut del = tx.prepare(&format!(
                "DELETE FROM {} WHERE sequence_id = ?1 AND message_number = ?2",
                Self::table(outbound)
            ))?;
            for &n in numbers {
                del.execute(params![key(id), n as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn try_persist_incoming(
        &self,
        record: &DestinationSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::write_destination(&tx, record)?;
        if let Some(m) = message {
            Self::write_message(&tx, &record.identifier, m, false)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn try_persist_outgoing(
        &self,
        record: &SourceSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::write_source(&tx, record)?;
        if let Some(m) = message {
            Self::write_message(&tx, &record.identifier, m, true)?;
        }
        tx.commit()?;
        Ok(())
    }
}

const SOURCE_COLUMNS: &str = "SELECT id, endpoint, protocol, current_message_number, last_message,
     expires_ms, offering_id, target FROM source_sequences";

const DESTINATION_COLUMNS: &str = "SELECT id, endpoint, protocol, acks_to, last_message_number,
     acknowledged, closed, terminated FROM destination_sequences";

fn key(id: &Identifier) -> &str {
    id.value().unwrap_or_default()
}

fn from_json<T: serde::de::DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn backend(e: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{:#}", e))
}

impl RmStore for SqliteStore {
    fn create_source_sequence(&self, record: &SourceSequenceRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        Self::write_source(&conn, record).map_err(backend)
    }

    fn create_destination_sequence(
        &self,
        record: &DestinationSequenceRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        Self::write_destination(&conn, record).map_err(backend)
    }

    fn get_source_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<SourceSequenceRecord>, StoreError> {
        self.try_get_source(id).map_err(backend)
    }

    fn get_destination_sequence(
        &self,
        id: &Identifier,
    ) -> Result<Option<DestinationSequenceRecord>, StoreError> {
        self.try_get_destination(id).map_err(backend)
    }

    fn remove_source_sequence(&self, id: &Identifier) -> Result<(), StoreError> {
        self.try_remove_sequence(id, true).map_err(backend)
    }

    fn remove_destination_sequence(&self, id: &Identifier) -> Result<(), StoreError> {
        self.try_remove_sequence(id, false).map_err(backend)
    }

    fn get_source_sequences(&self, endpoint: &str) -> Result<Vec<SourceSequenceRecord>, StoreError> {
        self.source_sequences(Some(endpoint)).map_err(backend)
    }

    fn get_destination_sequences(
        &self,
        endpoint: &str,
    ) -> Result<Vec<DestinationSequenceRecord>, StoreError> {
        self.destination_sequences(Some(endpoint)).map_err(backend)
    }

    fn get_messages(
        &self,
        id: &Identifier,
        outbound: bool,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.messages(id, outbound).map_err(backend)
    }

    fn remove_messages(
        &self,
        id: &Identifier,
        numbers: &[u64],
        outbound: bool,
    ) -> Result<(), StoreError> {
        self.try_remove_messages(id, numbers, outbound).map_err(backend)
    }

    fn persist_incoming(
        &self,
        record: &DestinationSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError> {
        self.try_persist_incoming(record, message).map_err(backend)
    }

    fn persist_outgoing(
        &self,
        record: &SourceSequenceRecord,
        message: Option<&StoredMessage>,
    ) -> Result<(), StoreError> {
        self.try_persist_outgoing(record, message).map_err(backend)
    }
}
