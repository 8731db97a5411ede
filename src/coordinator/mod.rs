//! Per-file database coordination.
//!
//! Exactly one coordinator exists per absolute database path, held in a
//! process-wide weak registry. The coordinator owns the database handle,
//! the history sidecar, the schema cache, the write serializer, and the
//! notifier worker; the sync layer attaches to it to integrate downloads
//! and select uploads.

pub mod external_commit;
pub mod notifier;
pub mod schema;
pub mod writes;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::{
    ClientFileIdent, ClientVersion, Limits, RemoteChangeset, SyncProgress, UploadChangeset,
    WallClockMillis,
};
use crate::paths;
use crate::storage::db::{DbError, MemoryDb, Snapshot, WriteTransaction};
use crate::storage::history::{HistoryError, SqliteHistory};

pub use external_commit::ExternalCommitHelper;
pub use notifier::{ChangeSet, NotifierId, NotifierWorker};
pub use schema::{Schema, SchemaCache};
pub use writes::{WriteError, WriteOutcome, WriteSerializer};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("changeset payload decode failed: {0}")]
    BadPayload(String),
}

/// One key-value operation inside a changeset payload.
///
/// Real deployments carry an operational-transform log here; the engine
/// only needs a deterministic application rule, which this reference
/// format provides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvOp {
    pub key: String,
    /// `None` deletes the key.
    pub value: Option<Vec<u8>>,
}

pub fn encode_payload(ops: &[KvOp]) -> Vec<u8> {
    serde_json::to_vec(ops).expect("kv ops serialize")
}

pub fn decode_payload(payload: &[u8]) -> Result<Vec<KvOp>, CoordinatorError> {
    serde_json::from_slice(payload).map_err(|err| CoordinatorError::BadPayload(err.to_string()))
}

type CommitListener = Box<dyn Fn(ClientVersion) + Send + Sync>;

/// The per-path coordinator.
pub struct DbCoordinator {
    db_path: PathBuf,
    db: MemoryDb,
    history: Arc<SqliteHistory>,
    schema_cache: SchemaCache,
    writes: WriteSerializer,
    notifier: NotifierWorker,
    external_commit: Option<ExternalCommitHelper>,
    commit_listeners: Mutex<Vec<CommitListener>>,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<DbCoordinator>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<DbCoordinator>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl DbCoordinator {
    /// The coordinator for `db_path`, created on first use. Subsequent
    /// calls return the same instance while any strong reference lives.
    pub fn get_coordinator(db_path: &Path) -> Result<Arc<DbCoordinator>, CoordinatorError> {
        let mut map = registry().lock().expect("coordinator registry poisoned");
        if let Some(existing) = map.get(db_path).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let coordinator = Arc::new(Self::open(db_path)?);
        map.insert(db_path.to_path_buf(), Arc::downgrade(&coordinator));
        Ok(coordinator)
    }

    fn open(db_path: &Path) -> Result<DbCoordinator, CoordinatorError> {
        let db = MemoryDb::open(db_path);
        let history = if db_path.parent().map(Path::is_dir).unwrap_or(false) {
            SqliteHistory::open(&paths::history_path(db_path))?
        } else {
            SqliteHistory::open_in_memory()?
        };
        let notifier = NotifierWorker::start(db.clone());
        let external_commit = if db_path.parent().map(Path::is_dir).unwrap_or(false) {
            let socket_path = ExternalCommitHelper::socket_path_for(db_path);
            ExternalCommitHelper::start(socket_path, notifier.wake_sender()).ok()
        } else {
            None
        };
        let coordinator = DbCoordinator {
            db_path: db_path.to_path_buf(),
            db: db.clone(),
            history: Arc::new(history),
            schema_cache: SchemaCache::new(),
            writes: WriteSerializer::new(db.clone(), Limits::default()),
            notifier,
            external_commit,
            commit_listeners: Mutex::new(Vec::new()),
        };
        debug!(target: "coordinator", path = %db_path.display(), "coordinator opened");
        Ok(coordinator)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    pub fn history(&self) -> &Arc<SqliteHistory> {
        &self.history
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub fn writes(&self) -> &WriteSerializer {
        &self.writes
    }

    pub fn notifier(&self) -> &NotifierWorker {
        &self.notifier
    }

    pub fn external_commit_socket(&self) -> Option<&Path> {
        self.external_commit
            .as_ref()
            .map(ExternalCommitHelper::socket_path)
    }

    /// Registers a listener invoked (before `commit_write` returns) with
    /// every new client version. The sync session hangs off this.
    pub fn add_commit_listener(&self, listener: impl Fn(ClientVersion) + Send + Sync + 'static) {
        self.commit_listeners
            .lock()
            .expect("commit listeners poisoned")
            .push(Box::new(listener));
    }

    /// A read transaction pinned at `version` (newest when `None`).
    pub fn begin_read(&self, version: Option<ClientVersion>) -> Result<Snapshot, CoordinatorError> {
        Ok(self.db.begin_read(version)?)
    }

    /// Synchronous local write producing an uploadable changeset. The
    /// session is notified of the new version before this returns.
    pub fn commit_write(
        &self,
        ops: &[KvOp],
        writer: impl FnOnce(&mut WriteTransaction),
    ) -> Result<ClientVersion, CoordinatorError> {
        let version = self.writes.commit_sync(writer)?;
        let progress = self.history.progress()?;
        self.history.append_local_changeset(
            version,
            progress.download.server_version,
            WallClockMillis::now().0,
            &encode_payload(ops),
        )?;
        self.after_commit(version);
        Ok(version)
    }

    /// Synchronous write with no sync-visible changeset (local metadata).
    pub fn commit_write_untracked(
        &self,
        writer: impl FnOnce(&mut WriteTransaction),
    ) -> Result<ClientVersion, CoordinatorError> {
        let version = self.writes.commit_sync(writer)?;
        self.history.set_last_version_available(version)?;
        self.after_commit(version);
        Ok(version)
    }

    fn after_commit(&self, version: ClientVersion) {
        self.notifier.notify_commit();
        let listeners = self
            .commit_listeners
            .lock()
            .expect("commit listeners poisoned");
        for listener in listeners.iter() {
            listener(version);
        }
    }

    /// Drops retained snapshots below the given floor.
    pub fn compact(&self, floor: ClientVersion) -> Result<(), CoordinatorError> {
        Ok(self.db.trim_below(floor)?)
    }

    /// Wipes the database contents (the history sidecar stays; callers
    /// doing a client reset replace it separately).
    pub fn delete_and_reopen(&self) -> Result<ClientVersion, CoordinatorError> {
        let version = self.writes.commit_sync(|txn| {
            for key in txn.keys() {
                txn.delete(&key);
            }
        })?;
        self.history.set_last_version_available(version)?;
        self.after_commit(version);
        Ok(version)
    }

    /// The sync layer's view of this coordinator.
    pub fn sync_attachment(self: &Arc<Self>) -> SyncAttachment {
        SyncAttachment {
            coordinator: Arc::clone(self),
        }
    }
}

impl Drop for DbCoordinator {
    fn drop(&mut self) {
        let mut map = registry().lock().expect("coordinator registry poisoned");
        if let Some(entry) = map.get(&self.db_path) {
            if entry.upgrade().is_none() {
                map.remove(&self.db_path);
            }
        }
    }
}

/// Implements the session's integration seam on top of a coordinator.
#[derive(Clone)]
pub struct SyncAttachment {
    coordinator: Arc<DbCoordinator>,
}

impl SyncAttachment {
    pub fn coordinator(&self) -> &Arc<DbCoordinator> {
        &self.coordinator
    }
}

impl crate::client::session::SessionStore for SyncAttachment {
    fn client_file_ident(&self) -> ClientFileIdent {
        self.coordinator
            .history
            .client_file_ident()
            .unwrap_or_default()
    }

    fn set_client_file_ident(&mut self, ident: ClientFileIdent) -> Result<(), String> {
        self.coordinator
            .history
            .set_client_file_ident(ident, false)
            .map_err(|err| err.to_string())
    }

    fn sync_progress(&self) -> SyncProgress {
        self.coordinator.history.progress().unwrap_or_default()
    }

    fn last_version_available(&self) -> ClientVersion {
        self.coordinator
            .history
            .last_version_available()
            .unwrap_or_default()
    }

    fn uploadable_changesets(
        &self,
        after: ClientVersion,
        up_to: ClientVersion,
        max_count: usize,
    ) -> Vec<UploadChangeset> {
        self.coordinator
            .history
            .uploadable_changesets(after, up_to, max_count)
            .unwrap_or_default()
    }

    fn integrate_remote_changesets(
        &mut self,
        changesets: &[RemoteChangeset],
        progress: &SyncProgress,
    ) -> Result<ClientVersion, String> {
        if changesets.is_empty() {
            // Progress-only update: no new local version.
            self.coordinator
                .history
                .set_progress(progress)
                .map_err(|err| err.to_string())?;
            return self
                .coordinator
                .db
                .current_version()
                .map_err(|err| err.to_string());
        }
        let mut all_ops = Vec::new();
        for changeset in changesets {
            all_ops.extend(decode_payload(&changeset.payload).map_err(|err| err.to_string())?);
        }
        let version = self
            .coordinator
            .writes
            .commit_sync(|txn| {
                for op in &all_ops {
                    match &op.value {
                        Some(value) => txn.put(op.key.clone(), value.clone()),
                        None => txn.delete(&op.key),
                    }
                }
            })
            .map_err(|err| err.to_string())?;
        self.coordinator
            .history
            .integrate_remote_changesets(version, changesets, progress)
            .map_err(|err| err.to_string())?;
        self.coordinator.after_commit(version);
        Ok(version)
    }
}
