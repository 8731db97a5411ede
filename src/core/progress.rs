//! Sync progress cursors and their monotonicity rules.

use serde::{Deserialize, Serialize};

use super::version::{ClientVersion, SaltedServerVersion, ServerVersion};

/// How far the download direction has advanced: the position in the server's
/// history we have integrated up to, and the last client version the server
/// had integrated at that position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCursor {
    pub server_version: ServerVersion,
    pub last_integrated_client_version: ClientVersion,
}

/// How far the upload direction has advanced: the position in our history the
/// server has integrated up to, and the last server version we had integrated
/// when producing that position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    pub client_version: ClientVersion,
    pub last_integrated_server_version: ServerVersion,
}

/// The full progress negotiated between client and server.
///
/// Every DOWNLOAD message carries one of these; the persisted copy in the
/// history file is replaced wholesale each time a batch is integrated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub download: DownloadCursor,
    pub upload: UploadCursor,
    pub latest_server_version: SaltedServerVersion,
}

/// Which of the numbered progress rules a DOWNLOAD header violated.
///
/// The numbering is part of the diagnostic surface: it is logged and carried
/// in the `bad_progress` violation so a server-side trace can be matched to a
/// client-side one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressRule {
    LatestServerVersionRegressed = 1,
    UploadClientVersionRegressed = 2,
    UploadClientVersionAhead = 3,
    DownloadServerVersionRegressed = 4,
    DownloadAheadOfLatest = 5,
    DownloadClientVersionRegressed = 6,
    DownloadClientVersionAheadOfUpload = 7,
}

impl ProgressRule {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Validates an incoming `SyncProgress` against the previous one.
///
/// `last_version_available` is the newest version in the local history; the
/// server cannot claim to have integrated beyond it.
pub fn check_received_progress(
    previous: &SyncProgress,
    incoming: &SyncProgress,
    last_version_available: ClientVersion,
) -> Result<(), ProgressRule> {
    if incoming.latest_server_version.version < previous.latest_server_version.version {
        return Err(ProgressRule::LatestServerVersionRegressed);
    }
    if incoming.upload.client_version < previous.upload.client_version {
        return Err(ProgressRule::UploadClientVersionRegressed);
    }
    if incoming.upload.client_version > last_version_available {
        return Err(ProgressRule::UploadClientVersionAhead);
    }
    if incoming.download.server_version < previous.download.server_version {
        return Err(ProgressRule::DownloadServerVersionRegressed);
    }
    if incoming.download.server_version > incoming.latest_server_version.version {
        return Err(ProgressRule::DownloadAheadOfLatest);
    }
    if incoming.download.last_integrated_client_version
        < previous.download.last_integrated_client_version
    {
        return Err(ProgressRule::DownloadClientVersionRegressed);
    }
    if incoming.download.last_integrated_client_version > incoming.upload.client_version {
        return Err(ProgressRule::DownloadClientVersionAheadOfUpload);
    }
    Ok(())
}
