//! Durable client history: committed changesets, sync progress, file ident.
//!
//! A SQLite sidecar next to the database file. Everything the protocol
//! needs to survive a restart lives here: the changeset log with upload
//! metadata, the current [`SyncProgress`], the server-assigned
//! [`ClientFileIdent`], and the pending client-reset marker.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    ClientFileIdent, ClientVersion, RemoteChangeset, ServerVersion, SyncProgress, UploadChangeset,
};

const HISTORY_SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("history schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("client file ident already assigned")]
    IdentAlreadyAssigned,
    #[error("meta row decode failed: {0}")]
    MetaDecode(String),
    #[error("version {0} already recorded in history")]
    DuplicateVersion(ClientVersion),
}

/// Why a client reset is pending, persisted across restarts so a second
/// server-demanded reset while one is unresolved can be refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    DiscardLocal,
    Recover,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetMarker {
    pub kind: ResetKind,
    pub timestamp_ms: u64,
}

/// The history sidecar for one database file.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, HistoryError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS changesets (
                 version INTEGER PRIMARY KEY,
                 last_integrated_server_version INTEGER NOT NULL,
                 origin_file_ident INTEGER NOT NULL,
                 origin_timestamp INTEGER NOT NULL,
                 payload BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        let history = Self {
            conn: Mutex::new(conn),
            path,
        };
        history.check_schema_version()?;
        Ok(history)
    }

    fn check_schema_version(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![HISTORY_SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(raw) => {
                let got: u32 = raw
                    .parse()
                    .map_err(|_| HistoryError::MetaDecode(format!("schema_version: {raw}")))?;
                if got != HISTORY_SCHEMA_VERSION {
                    return Err(HistoryError::SchemaVersionMismatch {
                        expected: HISTORY_SCHEMA_VERSION,
                        got,
                    });
                }
                Ok(())
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn get_meta<T: for<'de> Deserialize<'de>>(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<T>, HistoryError> {
        let raw: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| HistoryError::MetaDecode(format!("{key}: {err}"))),
        }
    }

    fn put_meta<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), HistoryError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| HistoryError::MetaDecode(format!("{key}: {err}")))?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, raw],
        )?;
        Ok(())
    }

    pub fn client_file_ident(&self) -> Result<ClientFileIdent, HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Ok(Self::get_meta(&conn, "client_file_ident")?.unwrap_or(ClientFileIdent::UNASSIGNED))
    }

    /// Stores the server-assigned identity. Immutable once set; a client
    /// reset passes `force` to install the fresh identity.
    pub fn set_client_file_ident(
        &self,
        ident: ClientFileIdent,
        force: bool,
    ) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let existing: ClientFileIdent =
            Self::get_meta(&conn, "client_file_ident")?.unwrap_or(ClientFileIdent::UNASSIGNED);
        if existing.is_assigned() && !force {
            return Err(HistoryError::IdentAlreadyAssigned);
        }
        Self::put_meta(&conn, "client_file_ident", &ident)
    }

    pub fn progress(&self) -> Result<SyncProgress, HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Ok(Self::get_meta(&conn, "sync_progress")?.unwrap_or_default())
    }

    pub fn set_progress(&self, progress: &SyncProgress) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Self::put_meta(&conn, "sync_progress", progress)
    }

    /// Records a locally originated changeset at `version`.
    pub fn append_local_changeset(
        &self,
        version: ClientVersion,
        last_integrated_server_version: ServerVersion,
        origin_timestamp: u64,
        payload: &[u8],
    ) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO changesets
                 (version, last_integrated_server_version, origin_file_ident,
                  origin_timestamp, payload)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![
                version.get(),
                last_integrated_server_version.get(),
                origin_timestamp,
                payload
            ],
        )?;
        if inserted == 0 {
            return Err(HistoryError::DuplicateVersion(version));
        }
        Self::bump_last_version(&conn, version)
    }

    /// Records an integrated remote batch at `version` and replaces the
    /// stored progress, atomically.
    pub fn integrate_remote_changesets(
        &self,
        version: ClientVersion,
        changesets: &[RemoteChangeset],
        progress: &SyncProgress,
    ) -> Result<(), HistoryError> {
        let mut conn = self.conn.lock().expect("history lock poisoned");
        let txn = conn.transaction()?;
        for changeset in changesets {
            txn.execute(
                "INSERT OR REPLACE INTO changesets
                     (version, last_integrated_server_version, origin_file_ident,
                      origin_timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    version.get(),
                    changeset.remote_version.get(),
                    changeset.origin_file_ident,
                    changeset.origin_timestamp,
                    changeset.payload.as_ref(),
                ],
            )?;
        }
        Self::put_meta(&txn, "sync_progress", progress)?;
        Self::bump_last_version(&txn, version)?;
        txn.commit()?;
        Ok(())
    }

    fn bump_last_version(conn: &Connection, version: ClientVersion) -> Result<(), HistoryError> {
        let current: u64 = Self::get_meta(conn, "last_version_available")?.unwrap_or(0);
        if version.get() > current {
            Self::put_meta(conn, "last_version_available", &version.get())?;
        }
        Ok(())
    }

    /// Advances the newest-known version without recording a changeset
    /// (notify-only commits).
    pub fn set_last_version_available(&self, version: ClientVersion) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Self::bump_last_version(&conn, version)
    }

    pub fn last_version_available(&self) -> Result<ClientVersion, HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let version: u64 = Self::get_meta(&conn, "last_version_available")?.unwrap_or(0);
        Ok(ClientVersion::new(version))
    }

    /// Locally originated changesets strictly after `after`, up to and
    /// including `up_to`, capped at `max_count`.
    pub fn uploadable_changesets(
        &self,
        after: ClientVersion,
        up_to: ClientVersion,
        max_count: usize,
    ) -> Result<Vec<UploadChangeset>, HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT version, last_integrated_server_version, origin_timestamp, payload
             FROM changesets
             WHERE origin_file_ident = 0 AND version > ?1 AND version <= ?2
             ORDER BY version ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![after.get(), up_to.get(), max_count as i64],
            |row| {
                Ok(UploadChangeset {
                    client_version: ClientVersion::new(row.get::<_, u64>(0)?),
                    last_integrated_server_version: ServerVersion::new(row.get::<_, u64>(1)?),
                    origin_timestamp: row.get(2)?,
                    origin_file_ident: 0,
                    payload: Bytes::from(row.get::<_, Vec<u8>>(3)?),
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drops every recorded changeset. Used by the client-reset swap: the
    /// pre-reset log is meaningless against the fresh server history.
    pub fn purge_changesets(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute("DELETE FROM changesets", [])?;
        Ok(())
    }

    pub fn reset_marker(&self) -> Result<Option<ResetMarker>, HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Self::get_meta(&conn, "reset_marker")
    }

    pub fn set_reset_marker(&self, marker: ResetMarker) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        Self::put_meta(&conn, "reset_marker", &marker)
    }

    pub fn clear_reset_marker(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute("DELETE FROM meta WHERE key = 'reset_marker'", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DownloadCursor, SaltedServerVersion, UploadCursor};

    fn history() -> SqliteHistory {
        SqliteHistory::open_in_memory().unwrap()
    }

    #[test]
    fn file_ident_is_assigned_once() {
        let history = history();
        assert!(!history.client_file_ident().unwrap().is_assigned());
        history
            .set_client_file_ident(ClientFileIdent::new(1234, 42), false)
            .unwrap();
        assert_eq!(
            history.client_file_ident().unwrap(),
            ClientFileIdent::new(1234, 42)
        );
        assert!(matches!(
            history.set_client_file_ident(ClientFileIdent::new(5, 6), false),
            Err(HistoryError::IdentAlreadyAssigned)
        ));
        // client reset replaces it
        history
            .set_client_file_ident(ClientFileIdent::new(5, 6), true)
            .unwrap();
        assert_eq!(
            history.client_file_ident().unwrap(),
            ClientFileIdent::new(5, 6)
        );
    }

    #[test]
    fn progress_round_trips() {
        let history = history();
        assert_eq!(history.progress().unwrap(), SyncProgress::default());
        let progress = SyncProgress {
            download: DownloadCursor {
                server_version: ServerVersion::new(10),
                last_integrated_client_version: ClientVersion::new(2),
            },
            upload: UploadCursor {
                client_version: ClientVersion::new(3),
                last_integrated_server_version: ServerVersion::new(9),
            },
            latest_server_version: SaltedServerVersion::new(ServerVersion::new(12), 7),
        };
        history.set_progress(&progress).unwrap();
        assert_eq!(history.progress().unwrap(), progress);
    }

    #[test]
    fn upload_selection_skips_remote_origin_entries() {
        let history = history();
        history
            .append_local_changeset(ClientVersion::new(1), ServerVersion::ZERO, 100, b"local1")
            .unwrap();
        let remote = RemoteChangeset {
            remote_version: ServerVersion::new(5),
            last_integrated_local_version: ClientVersion::new(1),
            origin_file_ident: 77,
            origin_timestamp: 200,
            payload: Bytes::from_static(b"remote"),
        };
        history
            .integrate_remote_changesets(
                ClientVersion::new(2),
                std::slice::from_ref(&remote),
                &SyncProgress::default(),
            )
            .unwrap();
        history
            .append_local_changeset(ClientVersion::new(3), ServerVersion::new(5), 300, b"local2")
            .unwrap();

        let uploadable = history
            .uploadable_changesets(ClientVersion::ZERO, ClientVersion::new(10), 100)
            .unwrap();
        let versions: Vec<u64> = uploadable.iter().map(|c| c.client_version.get()).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[test]
    fn upload_selection_respects_bounds_and_cap() {
        let history = history();
        for version in 1..=5u64 {
            history
                .append_local_changeset(
                    ClientVersion::new(version),
                    ServerVersion::ZERO,
                    version,
                    b"x",
                )
                .unwrap();
        }
        let uploadable = history
            .uploadable_changesets(ClientVersion::new(1), ClientVersion::new(4), 2)
            .unwrap();
        let versions: Vec<u64> = uploadable.iter().map(|c| c.client_version.get()).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let history = history();
        history
            .append_local_changeset(ClientVersion::new(1), ServerVersion::ZERO, 0, b"a")
            .unwrap();
        assert!(matches!(
            history.append_local_changeset(ClientVersion::new(1), ServerVersion::ZERO, 0, b"b"),
            Err(HistoryError::DuplicateVersion(_))
        ));
    }

    #[test]
    fn last_version_tracks_notify_only_commits() {
        let history = history();
        history
            .append_local_changeset(ClientVersion::new(1), ServerVersion::ZERO, 0, b"a")
            .unwrap();
        history
            .set_last_version_available(ClientVersion::new(4))
            .unwrap();
        assert_eq!(history.last_version_available().unwrap().get(), 4);
        // regressions are ignored
        history
            .set_last_version_available(ClientVersion::new(2))
            .unwrap();
        assert_eq!(history.last_version_available().unwrap().get(), 4);
    }

    #[test]
    fn reset_marker_round_trips() {
        let history = history();
        assert_eq!(history.reset_marker().unwrap(), None);
        let marker = ResetMarker {
            kind: ResetKind::Recover,
            timestamp_ms: 12345,
        };
        history.set_reset_marker(marker).unwrap();
        assert_eq!(history.reset_marker().unwrap(), Some(marker));
        history.clear_reset_marker().unwrap();
        assert_eq!(history.reset_marker().unwrap(), None);
    }
}
