//! Session manager and user registry.
//!
//! Maps `(user identity, database path)` to a live session entry: the
//! first `get_session` for a pair creates and registers it, later calls
//! return the same entry. Fatal errors route file-system actions through
//! the durable metadata queue, drained at startup before any sync begins.

pub mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use crate::client::wrapper::SessionLifecycle;
use crate::config::{ClientConfig, MetadataMode, SyncConfig};
use crate::core::WallClockMillis;
use crate::paths;

pub use metadata::{FileAction, MetadataError, MetadataStore, PendingFileAction, UserRecord};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One registered session: its lifecycle plus the config it was opened
/// with. The transport side hangs off the event loop separately.
pub struct SessionEntry {
    pub user_identity: String,
    pub db_path: PathBuf,
    pub sync_config: SyncConfig,
    pub lifecycle: Mutex<SessionLifecycle>,
}

type SessionKey = (String, PathBuf);

pub struct SyncManager {
    config: ClientConfig,
    metadata: Option<MetadataStore>,
    sessions: Mutex<HashMap<SessionKey, Arc<SessionEntry>>>,
}

impl SyncManager {
    /// Opens the manager and drains pending file actions before anything
    /// else can touch the affected files.
    pub fn open(config: ClientConfig) -> Result<Self, ManagerError> {
        let metadata = match config.metadata_mode {
            MetadataMode::None => None,
            MetadataMode::Plain | MetadataMode::Encrypted => {
                let path = paths::metadata_path(&config.base_file_path);
                if path.parent().map(Path::is_dir).unwrap_or(false) {
                    Some(MetadataStore::open(&path)?)
                } else {
                    Some(MetadataStore::open_in_memory()?)
                }
            }
        };
        let manager = Self {
            config,
            metadata,
            sessions: Mutex::new(HashMap::new()),
        };
        manager.run_pending_file_actions()?;
        Ok(manager)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.metadata.as_ref()
    }

    /// The session entry for `(user, path)`, created on first use.
    pub fn get_session(
        &self,
        user_identity: &str,
        db_path: &Path,
        sync_config: SyncConfig,
    ) -> Arc<SessionEntry> {
        let key = (user_identity.to_string(), db_path.to_path_buf());
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        if let Some(existing) = sessions.get(&key) {
            return Arc::clone(existing);
        }
        let entry = Arc::new(SessionEntry {
            user_identity: user_identity.to_string(),
            db_path: db_path.to_path_buf(),
            lifecycle: Mutex::new(SessionLifecycle::new(
                sync_config.cancel_waits_on_nonfatal_error,
            )),
            sync_config,
        });
        sessions.insert(key, Arc::clone(&entry));
        entry
    }

    pub fn has_session(&self, user_identity: &str, db_path: &Path) -> bool {
        let key = (user_identity.to_string(), db_path.to_path_buf());
        self.sessions
            .lock()
            .expect("session map poisoned")
            .contains_key(&key)
    }

    /// Forgets the entry; the caller has already torn down the transport
    /// session. No callback runs while the map lock is held.
    pub fn remove_session(&self, user_identity: &str, db_path: &Path) -> Option<Arc<SessionEntry>> {
        let key = (user_identity.to_string(), db_path.to_path_buf());
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&key)
    }

    /// Queues the file action a fatal error demanded; it runs on the next
    /// launch, before sync.
    pub fn queue_file_action(&self, db_path: &Path, action: FileAction) -> Result<(), ManagerError> {
        if let Some(metadata) = &self.metadata {
            metadata.enqueue_file_action(db_path, action, WallClockMillis::now().0)?;
        }
        Ok(())
    }

    fn run_pending_file_actions(&self) -> Result<(), ManagerError> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };
        for pending in metadata.pending_file_actions()? {
            match self.execute_file_action(&pending) {
                Ok(()) => {
                    metadata.complete_file_action(pending.id)?;
                }
                Err(err) => {
                    // Left queued; retried next launch.
                    warn!(
                        target: "manager",
                        path = %pending.path.display(),
                        error = %err,
                        "file action failed"
                    );
                }
            }
        }
        Ok(())
    }

    fn execute_file_action(&self, pending: &PendingFileAction) -> Result<(), ManagerError> {
        if !pending.path.exists() {
            return Ok(());
        }
        match pending.action {
            FileAction::DeleteRealm => {
                delete_file_set(&pending.path)?;
                info!(target: "manager", path = %pending.path.display(), "deleted database");
            }
            FileAction::BackUpThenDeleteRealm => {
                let backup = paths::backup_path(&pending.path, WallClockMillis::now().0);
                std::fs::copy(&pending.path, &backup).map_err(|source| ManagerError::Io {
                    path: backup.clone(),
                    source,
                })?;
                delete_file_set(&pending.path)?;
                info!(
                    target: "manager",
                    path = %pending.path.display(),
                    backup = %backup.display(),
                    "backed up and deleted database"
                );
            }
        }
        Ok(())
    }
}

fn delete_file_set(db_path: &Path) -> Result<(), ManagerError> {
    for path in [
        db_path.to_path_buf(),
        paths::history_path(db_path),
        paths::pending_bootstrap_path(db_path),
        paths::fresh_copy_path(db_path),
    ] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ManagerError::Io { path, source }),
        }
    }
    Ok(())
}
