//! On-disk buffer for multi-message query bootstraps.
//!
//! A flexible-sync bootstrap arrives as several DOWNLOAD messages that must
//! not touch the database until the last one is stored. Messages are
//! persisted verbatim (re-encoded protocol frames) in a SQLite table; once
//! the batch is complete it is drained in byte-bounded chunks, each applied
//! atomically with the progress recorded by its last message. A partial
//! batch found at open time is discarded.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::core::{Limits, QueryVersion, RemoteChangeset, SyncProgress};
use crate::protocol::{self, Download, ServerMessage};

#[derive(Debug, Error)]
pub enum BootstrapStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored message failed to decode: {0}")]
    Decode(String),
    #[error("stored message failed to encode: {0}")]
    Encode(String),
    #[error("pending bootstrap exceeds limits ({0})")]
    LimitExceeded(&'static str),
}

/// One drainable chunk of a completed bootstrap.
#[derive(Debug)]
pub struct BootstrapBatch {
    pub changesets: Vec<RemoteChangeset>,
    /// Progress recorded by the last message in this chunk.
    pub progress: SyncProgress,
    pub downloadable_bytes: u64,
    /// Messages still stored after this chunk.
    pub remaining: usize,
}

pub struct PendingBootstrapStore {
    conn: Connection,
    limits: Limits,
}

impl PendingBootstrapStore {
    pub fn open(path: &Path, limits: Limits) -> Result<Self, BootstrapStoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, limits)
    }

    pub fn in_memory() -> Result<Self, BootstrapStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, Limits::default())
    }

    fn init(conn: Connection, limits: Limits) -> Result<Self, BootstrapStoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_messages (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 query_version INTEGER NOT NULL,
                 last_in_batch INTEGER NOT NULL,
                 byte_len INTEGER NOT NULL,
                 message BLOB NOT NULL
             );",
        )?;
        let store = Self { conn, limits };
        store.discard_incomplete()?;
        Ok(store)
    }

    /// Drops everything unless the stored batch ends with a last-in-batch
    /// message. Called at open so a crash mid-bootstrap leaves nothing.
    fn discard_incomplete(&self) -> Result<(), BootstrapStoreError> {
        let complete: Option<bool> = self
            .conn
            .query_row(
                "SELECT last_in_batch FROM pending_messages ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        if complete == Some(false) {
            self.conn.execute("DELETE FROM pending_messages", [])?;
        }
        Ok(())
    }

    pub fn store_message(&mut self, message: &Download) -> Result<(), BootstrapStoreError> {
        let encoded =
            protocol::encode_server_message(&ServerMessage::Download(message.clone()), &self.limits)
                .map_err(|err| BootstrapStoreError::Encode(err.to_string()))?;
        let payload_bytes: usize = message.changesets.iter().map(|c| c.payload.len()).sum();

        let (count, bytes) = self.totals()?;
        if count + 1 > self.limits.max_pending_bootstrap_changesets {
            return Err(BootstrapStoreError::LimitExceeded(
                "max_pending_bootstrap_changesets",
            ));
        }
        if bytes + payload_bytes > self.limits.max_pending_bootstrap_bytes {
            return Err(BootstrapStoreError::LimitExceeded(
                "max_pending_bootstrap_bytes",
            ));
        }

        self.conn.execute(
            "INSERT INTO pending_messages (query_version, last_in_batch, byte_len, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message.query_version.get(),
                message.last_in_batch as i64,
                payload_bytes as i64,
                encoded
            ],
        )?;
        Ok(())
    }

    fn totals(&self) -> Result<(usize, usize), BootstrapStoreError> {
        let (count, bytes): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(byte_len) FROM pending_messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, bytes.unwrap_or(0) as usize))
    }

    pub fn message_count(&self) -> usize {
        self.totals().map(|(count, _)| count).unwrap_or(0)
    }

    pub fn query_version(&self) -> Result<Option<QueryVersion>, BootstrapStoreError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT query_version FROM pending_messages ORDER BY seq ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(QueryVersion::new))
    }

    pub fn has_complete_batch(&self) -> Result<bool, BootstrapStoreError> {
        let complete: Option<bool> = self
            .conn
            .query_row(
                "SELECT last_in_batch FROM pending_messages ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        Ok(complete == Some(true))
    }

    /// Pops messages from the front until `max_bytes` of changeset payload
    /// is reached (always at least one message). Returns `None` when empty.
    pub fn next_chunk(
        &mut self,
        max_bytes: usize,
    ) -> Result<Option<BootstrapBatch>, BootstrapStoreError> {
        let mut rows: Vec<(i64, Vec<u8>, usize)> = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT seq, message, byte_len FROM pending_messages ORDER BY seq ASC",
            )?;
            let mut budget = 0usize;
            let mut iter = stmt.query([])?;
            while let Some(row) = iter.next()? {
                let seq: i64 = row.get(0)?;
                let message: Vec<u8> = row.get(1)?;
                let byte_len: i64 = row.get(2)?;
                let byte_len = byte_len as usize;
                if !rows.is_empty() && budget + byte_len > max_bytes {
                    break;
                }
                budget += byte_len;
                rows.push((seq, message, byte_len));
                if budget >= max_bytes {
                    break;
                }
            }
        }
        let Some((last_seq, _, _)) = rows.last() else {
            return Ok(None);
        };
        let last_seq = *last_seq;

        let mut changesets = Vec::new();
        let mut progress = SyncProgress::default();
        let mut downloadable_bytes = 0;
        for (_, encoded, _) in &rows {
            let decoded = protocol::decode_server_message(encoded, &self.limits)
                .map_err(|err| BootstrapStoreError::Decode(err.to_string()))?;
            let ServerMessage::Download(download) = decoded else {
                return Err(BootstrapStoreError::Decode(
                    "stored message is not a DOWNLOAD".into(),
                ));
            };
            changesets.extend(download.changesets);
            progress = download.progress;
            downloadable_bytes = download.downloadable_bytes;
        }

        self.conn.execute(
            "DELETE FROM pending_messages WHERE seq <= ?1",
            params![last_seq],
        )?;
        let (remaining, _) = self.totals()?;

        Ok(Some(BootstrapBatch {
            changesets,
            progress,
            downloadable_bytes,
            remaining,
        }))
    }

    pub fn clear(&mut self) -> Result<(), BootstrapStoreError> {
        self.conn.execute("DELETE FROM pending_messages", [])?;
        Ok(())
    }
}
