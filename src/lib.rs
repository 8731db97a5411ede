//! driftwire: a client-side sync engine for embedded databases.
//!
//! The engine replicates a local change history with a remote server over
//! a persistent WebSocket connection: it negotiates progress cursors,
//! uploads local commits, integrates server changesets, buffers flexible
//! sync bootstraps, and recovers from disconnects and divergence (client
//! reset). Everything network-facing runs on one event-loop thread; the
//! per-file coordinator serializes writes and feeds change notifications
//! to application threads.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod manager;
pub mod paths;
pub mod protocol;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most embedders touch.
pub use crate::client::{
    ClientResetError, Connection, ConnectionId, ConnectionState, EventLoop, FreshCopy,
    LifecycleEffect, LifecycleState, MockTransport, PendingBootstrapStore, PendingQuery,
    ReconnectMode, ResetObservers, ResetOutcome, Session, SessionConfig, SessionEffect,
    SessionLifecycle, SessionState, SessionStore, SubscriptionProtocolState, SubscriptionSet,
    SubscriptionSetState, SubscriptionStore, SyncClient,
};
pub use crate::config::{
    ClientConfig, ClientResyncMode, MetadataMode, ProxyConfig, StopPolicy, SyncConfig,
};
pub use crate::coordinator::{
    ChangeSet, DbCoordinator, KvOp, NotifierId, NotifierWorker, Schema, SchemaCache,
    SyncAttachment, WriteOutcome, WriteSerializer,
};
pub use crate::core::{
    ClientErrorCode, ClientFileIdent, ClientVersion, CloseCode, DownloadCursor, Limits,
    ProtocolEnvelope, QueryVersion, RemoteChangeset, RequestIdent, ResumptionDelayInfo,
    SaltedServerVersion, ServerEndpoint, ServerRequestedAction, ServerVersion, SessionErrorInfo,
    SessionIdent, SyncProgress, TerminationReason, UploadChangeset, UploadCursor,
};
pub use crate::manager::{FileAction, MetadataStore, SyncManager, UserRecord};
pub use crate::protocol::{ClientMessage, Download, DownloadBatchState, ServerMessage, SyncFlavor};
pub use crate::storage::{MemoryDb, Snapshot, SqliteHistory};
