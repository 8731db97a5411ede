//! Error taxonomies: transport, WebSocket, client protocol, server protocol.
//!
//! Failures cross this layer as data, not as Rust errors: a server-reported
//! problem becomes a [`SessionErrorInfo`] envelope and propagation is decided
//! by matching on its fields. Rust error types are reserved for local
//! capability failures (storage, codec, coordinator).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::version::SessionIdent;

/// Why a connection was (or is about to be) torn down. Keyed by the backoff
/// controller to choose the next reconnect delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    ClosedVoluntarily,
    ReadOrWriteError,
    PongTimeout,
    ConnectOperationFailed,
    HttpResponseSaysNonfatalError,
    SyncConnectTimeout,
    ServerSaidTryAgainLater,
    SslCertificateRejected,
    SslProtocolViolation,
    WebSocketProtocolViolation,
    HttpResponseSaysFatalError,
    BadHeadersInHttpResponse,
    SyncProtocolViolation,
    ServerSaidDoNotReconnect,
    MissingProtocolFeature,
}

impl TerminationReason {
    /// Voluntary terminations restart the backoff from the minimum delay.
    pub fn was_voluntary(self) -> bool {
        matches!(
            self,
            TerminationReason::ClosedVoluntarily
                | TerminationReason::ReadOrWriteError
                | TerminationReason::PongTimeout
        )
    }

    /// Fatal causes take the long cool-off and mark the session machinery
    /// as requiring outside intervention before a retry is useful.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TerminationReason::SslCertificateRejected
                | TerminationReason::SslProtocolViolation
                | TerminationReason::HttpResponseSaysFatalError
                | TerminationReason::BadHeadersInHttpResponse
                | TerminationReason::SyncProtocolViolation
                | TerminationReason::ServerSaidDoNotReconnect
                | TerminationReason::MissingProtocolFeature
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::ClosedVoluntarily => "closed_voluntarily",
            TerminationReason::ReadOrWriteError => "read_or_write_error",
            TerminationReason::PongTimeout => "pong_timeout",
            TerminationReason::ConnectOperationFailed => "connect_operation_failed",
            TerminationReason::HttpResponseSaysNonfatalError => {
                "http_response_says_nonfatal_error"
            }
            TerminationReason::SyncConnectTimeout => "sync_connect_timeout",
            TerminationReason::ServerSaidTryAgainLater => "server_said_try_again_later",
            TerminationReason::SslCertificateRejected => "ssl_certificate_rejected",
            TerminationReason::SslProtocolViolation => "ssl_protocol_violation",
            TerminationReason::WebSocketProtocolViolation => "websocket_protocol_violation",
            TerminationReason::HttpResponseSaysFatalError => "http_response_says_fatal_error",
            TerminationReason::BadHeadersInHttpResponse => "bad_headers_in_http_response",
            TerminationReason::SyncProtocolViolation => "sync_protocol_violation",
            TerminationReason::ServerSaidDoNotReconnect => "server_said_do_not_reconnect",
            TerminationReason::MissingProtocolFeature => "missing_protocol_feature",
        };
        f.write_str(name)
    }
}

/// Client-side protocol violations and local failure conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorCode {
    ConnectionClosed,
    UnknownMessage,
    BadSyntax,
    LimitsExceeded,
    BadSessionIdent,
    BadMessageOrder,
    BadClientFileIdent,
    BadProgress,
    BadChangesetHeaderSyntax,
    BadChangesetSize,
    BadOriginFileIdent,
    BadServerVersion,
    BadClientVersion,
    BadRequestIdent,
    BadError,
    BadTimestamp,
    BadChangeset,
    ConnectTimeout,
    PongTimeout,
    MissingProtocolFeature,
    HttpTunnelFailed,
    AutoClientResetFailure,
}

impl ClientErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientErrorCode::ConnectionClosed => "connection_closed",
            ClientErrorCode::UnknownMessage => "unknown_message",
            ClientErrorCode::BadSyntax => "bad_syntax",
            ClientErrorCode::LimitsExceeded => "limits_exceeded",
            ClientErrorCode::BadSessionIdent => "bad_session_ident",
            ClientErrorCode::BadMessageOrder => "bad_message_order",
            ClientErrorCode::BadClientFileIdent => "bad_client_file_ident",
            ClientErrorCode::BadProgress => "bad_progress",
            ClientErrorCode::BadChangesetHeaderSyntax => "bad_changeset_header_syntax",
            ClientErrorCode::BadChangesetSize => "bad_changeset_size",
            ClientErrorCode::BadOriginFileIdent => "bad_origin_file_ident",
            ClientErrorCode::BadServerVersion => "bad_server_version",
            ClientErrorCode::BadClientVersion => "bad_client_version",
            ClientErrorCode::BadRequestIdent => "bad_request_ident",
            ClientErrorCode::BadError => "bad_error",
            ClientErrorCode::BadTimestamp => "bad_timestamp",
            ClientErrorCode::BadChangeset => "bad_changeset",
            ClientErrorCode::ConnectTimeout => "connect_timeout",
            ClientErrorCode::PongTimeout => "pong_timeout",
            ClientErrorCode::MissingProtocolFeature => "missing_protocol_feature",
            ClientErrorCode::HttpTunnelFailed => "http_tunnel_failed",
            ClientErrorCode::AutoClientResetFailure => "auto_client_reset_failure",
        }
    }
}

impl fmt::Display for ClientErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server instructs the client to do alongside an ERROR message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRequestedAction {
    #[default]
    NoAction,
    ProtocolViolation,
    ApplicationBug,
    Warning,
    Transient,
    DeleteRealm,
    ClientReset,
    ClientResetNoRecovery,
}

impl ServerRequestedAction {
    pub fn requires_client_reset(self) -> bool {
        matches!(
            self,
            ServerRequestedAction::ClientReset | ServerRequestedAction::ClientResetNoRecovery
        )
    }
}

/// Backoff parameters the server attaches to a `try_again` ERROR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionDelayInfo {
    pub max_resumption_delay_interval: Duration,
    pub resumption_delay_interval: Duration,
    pub resumption_delay_backoff_multiplier: u32,
}

impl Default for ResumptionDelayInfo {
    fn default() -> Self {
        Self {
            max_resumption_delay_interval: Duration::from_secs(300),
            resumption_delay_interval: Duration::from_secs(1),
            resumption_delay_backoff_multiplier: 2,
        }
    }
}

/// Iterates the delay sequence dictated by a [`ResumptionDelayInfo`]:
/// initial, initial*m, initial*m^2, ... saturating at the cap. A success
/// resets it to the initial interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumptionDelayState {
    info: ResumptionDelayInfo,
    current: Option<Duration>,
}

impl ResumptionDelayState {
    pub fn new(info: ResumptionDelayInfo) -> Self {
        Self {
            info,
            current: None,
        }
    }

    pub fn info(&self) -> &ResumptionDelayInfo {
        &self.info
    }

    /// The delay to apply for the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.info.resumption_delay_interval,
            Some(current) => current
                .checked_mul(self.info.resumption_delay_backoff_multiplier)
                .unwrap_or(self.info.max_resumption_delay_interval)
                .min(self.info.max_resumption_delay_interval),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// A server-reported error, connection-level (`session_ident == 0`) or
/// session-level, as data. Propagation policy matches on `try_again`,
/// `action`, and the code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionErrorInfo {
    pub raw_error_code: i32,
    pub message: String,
    pub try_again: bool,
    pub action: ServerRequestedAction,
    pub resumption_delay_info: Option<ResumptionDelayInfo>,
    pub session_ident: SessionIdent,
    /// Set when the code was not recognized; the error is passed through as
    /// an opaque fatal error.
    pub unrecognized_by_client: bool,
    /// Server version carried by `compensating_write` errors; delivery is
    /// deferred until the DOWNLOAD carrying this version arrives.
    pub compensating_write_server_version: Option<u64>,
}

impl SessionErrorInfo {
    pub fn new(raw_error_code: i32, message: impl Into<String>, try_again: bool) -> Self {
        Self {
            raw_error_code,
            message: message.into(),
            try_again,
            action: ServerRequestedAction::NoAction,
            resumption_delay_info: None,
            session_ident: SessionIdent::CONNECTION,
            unrecognized_by_client: false,
            compensating_write_server_version: None,
        }
    }

    pub fn from_client_error(code: ClientErrorCode) -> Self {
        let mut info = Self::new(0, code.as_str(), false);
        info.action = ServerRequestedAction::ProtocolViolation;
        info
    }

    pub fn with_action(mut self, action: ServerRequestedAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_session_ident(mut self, ident: SessionIdent) -> Self {
        self.session_ident = ident;
        self
    }

    pub fn with_resumption_delay(mut self, info: ResumptionDelayInfo) -> Self {
        self.resumption_delay_info = Some(info);
        self
    }

    pub fn is_connection_level(&self) -> bool {
        self.session_ident == SessionIdent::CONNECTION
    }

    pub fn is_fatal(&self) -> bool {
        !self.try_again
    }

    pub fn is_compensating_write(&self) -> bool {
        self.compensating_write_server_version.is_some()
    }
}

/// WebSocket close status as surfaced by the transport library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Name resolution or TCP connect failed.
    ResolveOrConnectFailed,
    /// An established socket failed mid-stream.
    ReadWriteError,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    InvalidPayloadData,
    PolicyViolation,
    MessageTooBig,
    InvalidExtension,
    Reserved,
    TlsHandshakeFailed,
    /// HTTP 4xx telling this client build is too old.
    ClientTooOld,
    /// HTTP 4xx telling this client build is too new.
    ClientTooNew,
    /// No protocol version overlap between client and server.
    ProtocolMismatch,
    Forbidden,
    RetryError,
    Unauthorized,
    MovedPermanently,
    InternalServerError,
    AbnormalClosure,
}

/// The classification a close code maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseClassification {
    pub reason: TerminationReason,
    pub is_fatal: bool,
    /// Set for close codes that additionally demand a client reset
    /// (currently only `MessageTooBig`).
    pub action: ServerRequestedAction,
}

/// Maps a WebSocket close status to the termination reason that drives
/// backoff and error reporting.
pub fn classify_close_code(code: CloseCode) -> CloseClassification {
    use ServerRequestedAction::{ClientReset, NoAction};
    let (reason, is_fatal, action) = match code {
        CloseCode::ResolveOrConnectFailed => {
            (TerminationReason::ConnectOperationFailed, false, NoAction)
        }
        CloseCode::ReadWriteError => (TerminationReason::ReadOrWriteError, false, NoAction),
        CloseCode::GoingAway
        | CloseCode::ProtocolError
        | CloseCode::UnsupportedData
        | CloseCode::InvalidPayloadData
        | CloseCode::PolicyViolation
        | CloseCode::InvalidExtension
        | CloseCode::Reserved => {
            (TerminationReason::WebSocketProtocolViolation, false, NoAction)
        }
        CloseCode::MessageTooBig => {
            (TerminationReason::WebSocketProtocolViolation, false, ClientReset)
        }
        CloseCode::TlsHandshakeFailed => {
            (TerminationReason::SslCertificateRejected, true, NoAction)
        }
        CloseCode::ClientTooOld
        | CloseCode::ClientTooNew
        | CloseCode::ProtocolMismatch
        | CloseCode::Forbidden
        | CloseCode::RetryError => {
            (TerminationReason::HttpResponseSaysFatalError, true, NoAction)
        }
        CloseCode::Unauthorized
        | CloseCode::MovedPermanently
        | CloseCode::InternalServerError
        | CloseCode::AbnormalClosure => (
            TerminationReason::HttpResponseSaysNonfatalError,
            false,
            NoAction,
        ),
    };
    CloseClassification {
        reason,
        is_fatal,
        action,
    }
}

/// Server-reported raw error codes this client understands.
///
/// Codes below 200 are connection-level, 200 and above are session-level.
/// The numeric values are part of the wire contract with the server.
pub mod server_error {
    pub const CONNECTION_CLOSED: i32 = 100;
    pub const OTHER_CONNECTION_ERROR: i32 = 101;
    pub const UNKNOWN_MESSAGE: i32 = 102;
    pub const BAD_SYNTAX: i32 = 103;
    pub const LIMITS_EXCEEDED: i32 = 104;
    pub const WRONG_PROTOCOL_VERSION: i32 = 105;
    pub const BAD_SESSION_IDENT: i32 = 106;
    pub const REUSE_OF_SESSION_IDENT: i32 = 107;
    pub const BOUND_IN_OTHER_SESSION: i32 = 108;
    pub const BAD_MESSAGE_ORDER: i32 = 109;

    pub const SESSION_CLOSED: i32 = 200;
    pub const OTHER_SESSION_ERROR: i32 = 201;
    pub const TOKEN_EXPIRED: i32 = 202;
    pub const BAD_AUTHENTICATION: i32 = 203;
    pub const ILLEGAL_SERVER_PATH: i32 = 204;
    pub const NO_SUCH_PATH: i32 = 205;
    pub const PERMISSION_DENIED: i32 = 206;
    pub const BAD_SERVER_FILE_IDENT: i32 = 207;
    pub const BAD_CLIENT_FILE_IDENT: i32 = 208;
    pub const BAD_SERVER_VERSION: i32 = 209;
    pub const BAD_CLIENT_VERSION: i32 = 210;
    pub const DIVERGING_HISTORIES: i32 = 211;
    pub const BAD_CHANGESET: i32 = 212;
    pub const BAD_ORIGIN_FILE_IDENT: i32 = 216;
    pub const BAD_CLIENT_FILE: i32 = 217;
    pub const SERVER_FILE_DELETED: i32 = 218;
    pub const CLIENT_FILE_BLACKLISTED: i32 = 219;
    pub const USER_BLACKLISTED: i32 = 220;
    pub const TRANSIENT_ERROR: i32 = 221;
    pub const INITIAL_SYNC_NOT_COMPLETED: i32 = 222;
    pub const WRITE_NOT_ALLOWED: i32 = 223;
    pub const COMPENSATING_WRITE: i32 = 231;
    pub const BAD_PROGRESS: i32 = 233;

    /// Whether this code addresses a single session rather than the whole
    /// connection.
    pub fn is_session_level(code: i32) -> bool {
        code >= 200
    }

    /// Whether this client recognizes the code at all. Unrecognized codes
    /// are passed through as opaque fatal errors.
    pub fn is_known(code: i32) -> bool {
        matches!(code, 100..=110 | 200..=223 | 231 | 233)
    }
}
