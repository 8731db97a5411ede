//! Client-reset orchestration.
//!
//! When the server demands a reset, the local file can no longer be
//! reconciled through normal sync. The orchestration downloads a fresh
//! copy into a sibling file (through a fresh session bound to the same
//! credentials), swaps it in, optionally replays unsynced local writes on
//! top, installs the fresh file identity, and finally notifies observers
//! with a frozen "before" snapshot and the live "after" state.
//!
//! A reset demanded while a previous one is still marked pending surfaces
//! `auto_client_reset_failure` instead of looping.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ClientResyncMode;
use crate::coordinator::{decode_payload, CoordinatorError, DbCoordinator};
use crate::core::{
    ClientErrorCode, ClientFileIdent, ClientVersion, SessionErrorInfo, SyncProgress,
    WallClockMillis,
};
use crate::storage::db::Snapshot;
use crate::storage::history::{ResetKind, ResetMarker};

#[derive(Debug, Error)]
pub enum ClientResetError {
    #[error("client reset mode is manual")]
    ManualMode,
    #[error("automatic client reset failed: {0}")]
    AutoResetFailure(String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// What the fresh session produced: the complete server-side state and the
/// progress and identity it negotiated.
pub struct FreshCopy {
    pub snapshot: Snapshot,
    pub client_file_ident: ClientFileIdent,
    pub progress: SyncProgress,
}

/// Observer pair for the reset: `before` sees a frozen pre-reset snapshot,
/// `after` sees the live post-reset state.
pub struct ResetObservers {
    pub before: Option<Box<dyn FnOnce(&Snapshot) + Send>>,
    pub after: Option<Box<dyn FnOnce(&Snapshot) + Send>>,
}

impl ResetObservers {
    pub fn none() -> Self {
        Self {
            before: None,
            after: None,
        }
    }
}

/// The outcome reported to the session wrapper.
#[derive(Debug, PartialEq)]
pub enum ResetOutcome {
    /// Local state replaced; recovered writes merged when requested.
    Completed {
        new_version: ClientVersion,
        recovered_changesets: usize,
    },
}

/// Performs the swap phase of a client reset on `coordinator`.
///
/// The caller has already run the fresh session to completion (download
/// complete for partition sync, subscription Complete for flexible sync)
/// and torn it down; `fresh` is what it produced.
pub fn perform_client_reset(
    coordinator: &Arc<DbCoordinator>,
    fresh: FreshCopy,
    mode: ClientResyncMode,
    error: &SessionErrorInfo,
    observers: ResetObservers,
) -> Result<ResetOutcome, ClientResetError> {
    if mode == ClientResyncMode::Manual {
        return Err(ClientResetError::ManualMode);
    }

    let history = coordinator.history();

    if history.reset_marker().map_err(CoordinatorError::from)?.is_some() {
        // A previous reset never resolved; a second server demand means
        // automatic recovery is not converging.
        return Err(ClientResetError::AutoResetFailure(
            ClientErrorCode::AutoClientResetFailure.as_str().to_string(),
        ));
    }

    let recovery_allowed = matches!(
        mode,
        ClientResyncMode::Recover | ClientResyncMode::RecoverOrDiscard
    );
    let recovery_demanded_off = error.action
        == crate::core::ServerRequestedAction::ClientResetNoRecovery;
    let recover = recovery_allowed && !recovery_demanded_off;
    if recovery_allowed && recovery_demanded_off && mode == ClientResyncMode::Recover {
        // The server forbids recovery and the configuration allows nothing
        // else.
        return Err(ClientResetError::AutoResetFailure(
            "server disallowed recovery".to_string(),
        ));
    }

    let kind = if recover {
        ResetKind::Recover
    } else {
        ResetKind::DiscardLocal
    };
    history
        .set_reset_marker(ResetMarker {
            kind,
            timestamp_ms: WallClockMillis::now().0,
        })
        .map_err(CoordinatorError::from)?;

    // Unsynced local writes, selected before the swap destroys them.
    let progress_before = history.progress().map_err(CoordinatorError::from)?;
    let last_local = history
        .last_version_available()
        .map_err(CoordinatorError::from)?;
    let pending = if recover {
        history
            .uploadable_changesets(progress_before.upload.client_version, last_local, usize::MAX)
            .map_err(CoordinatorError::from)?
    } else {
        Vec::new()
    };

    // Frozen "before" snapshot for observers.
    let before_snapshot = coordinator.begin_read(None)?;
    if let Some(before) = observers.before {
        before(&before_snapshot);
    }

    info!(
        target: "client",
        path = %coordinator.db_path().display(),
        mode = ?mode,
        recovered = pending.len(),
        "performing client reset"
    );

    // Swap in the fresh contents. The old changeset log refers to a
    // server history that no longer exists.
    let new_version = coordinator
        .db()
        .replace_contents(&fresh.snapshot)
        .map_err(CoordinatorError::from)?;
    history.purge_changesets().map_err(CoordinatorError::from)?;
    history
        .set_last_version_available(new_version)
        .map_err(CoordinatorError::from)?;

    // Replay recovered local writes on top of the fresh state. Each one
    // becomes a new local commit in the fresh history, uploadable through
    // the reset session.
    let mut recovered_changesets = 0;
    let mut final_version = new_version;
    for changeset in &pending {
        let ops = match decode_payload(&changeset.payload) {
            Ok(ops) => ops,
            Err(err) => {
                warn!(target: "client", error = %err, "skipping unrecoverable changeset");
                continue;
            }
        };
        final_version = coordinator.commit_write(&ops, |txn| {
            for op in &ops {
                match &op.value {
                    Some(value) => txn.put(op.key.clone(), value.clone()),
                    None => txn.delete(&op.key),
                }
            }
        })?;
        recovered_changesets += 1;
    }

    // Install the fresh identity and progress; the old identity is dead.
    history
        .set_client_file_ident(fresh.client_file_ident, true)
        .map_err(CoordinatorError::from)?;
    history
        .set_progress(&fresh.progress)
        .map_err(CoordinatorError::from)?;
    history.clear_reset_marker().map_err(CoordinatorError::from)?;

    let after_snapshot = coordinator.begin_read(None)?;
    if let Some(after) = observers.after {
        after(&after_snapshot);
    }

    Ok(ResetOutcome::Completed {
        new_version: final_version,
        recovered_changesets,
    })
}
