//! Crate-level error type.

use thiserror::Error;

use crate::client::bootstrap::BootstrapStoreError;
use crate::client::reset::ClientResetError;
use crate::coordinator::{CoordinatorError, WriteError};
use crate::manager::ManagerError;
use crate::protocol::{DecodeError, EncodeError};
use crate::storage::db::DbError;
use crate::storage::history::HistoryError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapStoreError),

    #[error(transparent)]
    Reset(#[from] ClientResetError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Db(DbError::WriteInProgress | DbError::StaleWrite { .. }) => {
                Transience::Retryable
            }
            Error::Db(_) => Transience::Permanent,
            Error::History(_) => Transience::Unknown,
            Error::Coordinator(_) => Transience::Unknown,
            Error::Write(WriteError::QueueFull(_)) => Transience::Retryable,
            Error::Write(_) => Transience::Permanent,
            Error::Bootstrap(_) => Transience::Unknown,
            Error::Reset(ClientResetError::ManualMode) => Transience::Permanent,
            Error::Reset(_) => Transience::Unknown,
            Error::Manager(_) => Transience::Unknown,
            Error::Encode(_) | Error::Decode(_) => Transience::Permanent,
        }
    }
}
