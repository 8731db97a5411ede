//! Domain types shared by every layer of the engine.

pub mod changeset;
pub mod endpoint;
pub mod error;
pub mod limits;
pub mod progress;
pub mod time;
pub mod version;

pub use changeset::{
    check_changeset_headers, ChangesetHeaderRule, RemoteChangeset, UploadChangeset,
};
pub use endpoint::{ProtocolEnvelope, ServerEndpoint};
pub use error::{
    classify_close_code, server_error, ClientErrorCode, CloseClassification, CloseCode,
    ResumptionDelayInfo, ResumptionDelayState, ServerRequestedAction, SessionErrorInfo,
    TerminationReason,
};
pub use limits::Limits;
pub use progress::{
    check_received_progress, DownloadCursor, ProgressRule, SyncProgress, UploadCursor,
};
pub use time::{MonotonicMillis, WallClockMillis};
pub use version::{
    ClientFileIdent, ClientVersion, QueryVersion, RequestIdent, SaltedServerVersion, ServerVersion,
    SessionIdent,
};
