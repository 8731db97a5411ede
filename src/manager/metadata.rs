//! Durable engine metadata: known users and pending file actions.
//!
//! A small SQLite store under the base directory. File actions queued by
//! fatal session errors (delete, back-up-then-delete) are drained at the
//! next launch before any sync starts.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row decode failed: {0}")]
    Decode(String),
}

/// A persisted user and its tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub identity: String,
    pub refresh_token: String,
    pub access_token: String,
    pub logged_in: bool,
}

/// What to do to a database file before it is used again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    DeleteRealm,
    BackUpThenDeleteRealm,
}

impl FileAction {
    fn as_str(self) -> &'static str {
        match self {
            FileAction::DeleteRealm => "delete",
            FileAction::BackUpThenDeleteRealm => "backup_then_delete",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delete" => Some(FileAction::DeleteRealm),
            "backup_then_delete" => Some(FileAction::BackUpThenDeleteRealm),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFileAction {
    pub id: i64,
    pub path: PathBuf,
    pub action: FileAction,
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, MetadataError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MetadataError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 user_id TEXT PRIMARY KEY,
                 identity TEXT NOT NULL,
                 refresh_token TEXT NOT NULL,
                 access_token TEXT NOT NULL,
                 logged_in INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS file_actions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 path TEXT NOT NULL,
                 action TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_user(&self, user: &UserRecord) -> Result<(), MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO users (user_id, identity, refresh_token, access_token, logged_in)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id) DO UPDATE SET
                 identity = excluded.identity,
                 refresh_token = excluded.refresh_token,
                 access_token = excluded.access_token,
                 logged_in = excluded.logged_in",
            params![
                user.user_id.to_string(),
                user.identity,
                user.refresh_token,
                user.access_token,
                user.logged_in as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>, MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.query_row(
            "SELECT user_id, identity, refresh_token, access_token, logged_in
             FROM users WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?
        .map(|(raw_id, identity, refresh_token, access_token, logged_in)| {
            let user_id = Uuid::parse_str(&raw_id)
                .map_err(|err| MetadataError::Decode(format!("user_id: {err}")))?;
            Ok(UserRecord {
                user_id,
                identity,
                refresh_token,
                access_token,
                logged_in: logged_in != 0,
            })
        })
        .transpose()
    }

    pub fn all_users(&self) -> Result<Vec<UserRecord>, MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT user_id, identity, refresh_token, access_token, logged_in FROM users",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut users = Vec::new();
        for row in rows {
            let (raw_id, identity, refresh_token, access_token, logged_in) = row?;
            let user_id = Uuid::parse_str(&raw_id)
                .map_err(|err| MetadataError::Decode(format!("user_id: {err}")))?;
            users.push(UserRecord {
                user_id,
                identity,
                refresh_token,
                access_token,
                logged_in: logged_in != 0,
            });
        }
        Ok(users)
    }

    /// Marks the user as logged out (401/403 on refresh escalates here).
    pub fn log_out_user(&self, user_id: Uuid) -> Result<(), MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "UPDATE users SET logged_in = 0, access_token = '', refresh_token = ''
             WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(())
    }

    pub fn enqueue_file_action(
        &self,
        path: &Path,
        action: FileAction,
        created_at_ms: u64,
    ) -> Result<(), MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO file_actions (path, action, created_at_ms) VALUES (?1, ?2, ?3)",
            params![
                path.to_string_lossy().into_owned(),
                action.as_str(),
                created_at_ms as i64
            ],
        )?;
        Ok(())
    }

    pub fn pending_file_actions(&self) -> Result<Vec<PendingFileAction>, MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let mut stmt =
            conn.prepare("SELECT id, path, action FROM file_actions ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut actions = Vec::new();
        for row in rows {
            let (id, path, raw_action) = row?;
            let action = FileAction::parse(&raw_action)
                .ok_or_else(|| MetadataError::Decode(format!("action: {raw_action}")))?;
            actions.push(PendingFileAction {
                id,
                path: PathBuf::from(path),
                action,
            });
        }
        Ok(actions)
    }

    pub fn complete_file_action(&self, id: i64) -> Result<(), MetadataError> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute("DELETE FROM file_actions WHERE id = ?1", params![id])?;
        Ok(())
    }
}
