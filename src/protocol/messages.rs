//! Sync protocol message schemas.
//!
//! Client to server: BIND, IDENT, UPLOAD, QUERY, MARK, UNBIND, PING, ERROR.
//! Server to client: IDENT, DOWNLOAD, MARK, UNBOUND, PONG, ERROR, QUERY_ERROR.

use crate::core::{
    ClientVersion, QueryVersion, RemoteChangeset, RequestIdent, SaltedServerVersion,
    ServerRequestedAction, ServerVersion, SessionIdent, SyncProgress, UploadChangeset,
};

/// Protocol versions this client can speak, newest first.
pub const PROTOCOL_VERSION_MAX: u32 = 8;
pub const PROTOCOL_VERSION_MIN: u32 = 6;

/// Where a DOWNLOAD message sits in a multi-message batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadBatchState {
    MoreToCome,
    LastInBatch,
    /// Not part of any bootstrap batch; apply immediately.
    SteadyState,
}

/// First message of a session: names the server-side file and asks for an
/// identity if the client does not have one yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bind {
    pub session_ident: SessionIdent,
    /// Server path (partition-based sync) or virtual path (flexible sync).
    pub path: String,
    pub need_client_file_ident: bool,
    pub is_subserver: bool,
    /// Signed access token for this session's user.
    pub signed_user_token: String,
}

/// Sent by the server in response to a BIND that requested an identity, and
/// echoed back by the client (with cursors) to activate the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentFromServer {
    pub session_ident: SessionIdent,
    pub client_file_ident: u64,
    pub client_file_ident_salt: i64,
}

/// Client-to-server IDENT: binds the session to a position in both histories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ident {
    pub session_ident: SessionIdent,
    pub client_file_ident: u64,
    pub client_file_ident_salt: i64,
    pub scan_server_version: ServerVersion,
    pub scan_client_version: ClientVersion,
    pub latest_server_version: SaltedServerVersion,
    /// Active query set for flexible sync, absent for partition-based sync.
    pub query: Option<IdentQuery>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentQuery {
    pub query_version: QueryVersion,
    pub query_body: String,
}

/// A batch of local changesets with the upload cursor they advance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub session_ident: SessionIdent,
    pub progress_client_version: ClientVersion,
    pub progress_server_version: ServerVersion,
    /// Server version the client guarantees it still holds history for.
    pub locked_server_version: ServerVersion,
    pub changesets: Vec<UploadChangeset>,
}

/// Flexible sync: announce a new query set version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub session_ident: SessionIdent,
    pub query_version: QueryVersion,
    pub query_body: String,
}

/// Download-completion probe; the server echoes the request ident once
/// everything it had as of the request has been sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
}

/// Orderly session shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unbind {
    pub session_ident: SessionIdent,
}

/// Heartbeat. `timestamp` is the sender's monotonic clock; `rtt` is the
/// round-trip time measured for the previous exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: u64,
    pub rtt: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub timestamp: u64,
}

/// Server-to-client DOWNLOAD: progress header plus zero or more changesets.
#[derive(Clone, Debug, PartialEq)]
pub struct Download {
    pub session_ident: SessionIdent,
    pub progress: SyncProgress,
    pub downloadable_bytes: u64,
    pub query_version: QueryVersion,
    pub last_in_batch: bool,
    pub changesets: Vec<RemoteChangeset>,
}

/// Server acknowledgement of a MARK request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkResponse {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
}

/// Server acknowledgement of UNBIND.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unbound {
    pub session_ident: SessionIdent,
}

/// Server-reported error, connection-level when `session_ident` is zero.
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolError {
    pub session_ident: SessionIdent,
    pub raw_error_code: i32,
    pub message: String,
    pub try_again: bool,
    pub action: ServerRequestedAction,
    pub resumption_delay_interval_ms: Option<u64>,
    pub resumption_delay_backoff_multiplier: Option<u32>,
    pub max_resumption_delay_interval_ms: Option<u64>,
    pub compensating_write_server_version: Option<u64>,
}

/// Flexible sync: the server rejected a query set version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryError {
    pub session_ident: SessionIdent,
    pub raw_error_code: i32,
    pub message: String,
    pub query_version: QueryVersion,
}

/// Test-only command channel, round-tripped verbatim by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCommand {
    pub session_ident: SessionIdent,
    pub request_ident: RequestIdent,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Bind(Bind),
    Ident(Ident),
    Upload(Upload),
    Query(Query),
    Mark(Mark),
    Unbind(Unbind),
    Ping(Ping),
    Error(ProtocolError),
    TestCommand(TestCommand),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Ident(IdentFromServer),
    Download(Download),
    Mark(MarkResponse),
    Unbound(Unbound),
    Pong(Pong),
    Error(ProtocolError),
    QueryError(QueryError),
    TestCommand(TestCommand),
}

impl ServerMessage {
    /// The session a message is addressed to; `None` for connection-level
    /// messages (PONG and connection-level ERROR).
    pub fn session_ident(&self) -> Option<SessionIdent> {
        let ident = match self {
            ServerMessage::Ident(msg) => msg.session_ident,
            ServerMessage::Download(msg) => msg.session_ident,
            ServerMessage::Mark(msg) => msg.session_ident,
            ServerMessage::Unbound(msg) => msg.session_ident,
            ServerMessage::Pong(_) => return None,
            ServerMessage::Error(msg) => {
                if msg.session_ident == SessionIdent::CONNECTION {
                    return None;
                }
                msg.session_ident
            }
            ServerMessage::QueryError(msg) => msg.session_ident,
            ServerMessage::TestCommand(msg) => msg.session_ident,
        };
        Some(ident)
    }
}

impl Download {
    pub fn batch_state(&self) -> DownloadBatchState {
        if self.query_version == QueryVersion::ZERO {
            return DownloadBatchState::SteadyState;
        }
        if self.last_in_batch {
            DownloadBatchState::LastInBatch
        } else {
            DownloadBatchState::MoreToCome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SyncProgress;

    fn download(query_version: i64, last_in_batch: bool) -> Download {
        Download {
            session_ident: SessionIdent::new(1),
            progress: SyncProgress::default(),
            downloadable_bytes: 0,
            query_version: QueryVersion::new(query_version),
            last_in_batch,
            changesets: Vec::new(),
        }
    }

    #[test]
    fn batch_state_classification() {
        assert_eq!(download(0, true).batch_state(), DownloadBatchState::SteadyState);
        assert_eq!(download(3, false).batch_state(), DownloadBatchState::MoreToCome);
        assert_eq!(download(3, true).batch_state(), DownloadBatchState::LastInBatch);
    }

    #[test]
    fn connection_level_error_has_no_session() {
        let error = ServerMessage::Error(ProtocolError {
            session_ident: SessionIdent::CONNECTION,
            raw_error_code: 100,
            message: "closed".into(),
            try_again: false,
            action: ServerRequestedAction::NoAction,
            resumption_delay_interval_ms: None,
            resumption_delay_backoff_multiplier: None,
            max_resumption_delay_interval_ms: None,
            compensating_write_server_version: None,
        });
        assert_eq!(error.session_ident(), None);
    }
}
