//! Changeset records exchanged with the server.

use bytes::Bytes;

use super::version::{ClientFileIdent, ClientVersion, ServerVersion};

/// A changeset delivered by the server inside a DOWNLOAD message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteChangeset {
    /// Position of this changeset in the server's history.
    pub remote_version: ServerVersion,
    /// Last local version the producer of this changeset had integrated.
    pub last_integrated_local_version: ClientVersion,
    /// File ident of the client that originated the change (the server
    /// itself uses a reserved positive ident).
    pub origin_file_ident: u64,
    /// Origin-side timestamp, milliseconds since the sync epoch.
    pub origin_timestamp: u64,
    /// Serialized operation log, opaque to this layer.
    pub payload: Bytes,
}

/// A changeset selected from the local history for an UPLOAD message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadChangeset {
    pub client_version: ClientVersion,
    pub last_integrated_server_version: ServerVersion,
    pub origin_timestamp: u64,
    pub origin_file_ident: u64,
    pub payload: Bytes,
}

/// Which per-changeset header rule a DOWNLOAD record violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangesetHeaderRule {
    /// Server version did not advance (or regressed during a bootstrap).
    BadServerVersion,
    /// Last integrated client version regressed or exceeded the header bound.
    BadClientVersion,
    /// Origin file ident was zero or named this client itself.
    BadOriginFileIdent,
}

/// Validates the changeset headers of one DOWNLOAD message.
///
/// `server_version_floor` and `client_version_floor` seed the running checks
/// from the session's download cursor; `client_version_ceiling` is the
/// message header's `download.last_integrated_client_version`. During a
/// flexible-sync bootstrap the server may resend a server version, so the
/// strict ordering is relaxed to weak.
pub fn check_changeset_headers(
    changesets: &[RemoteChangeset],
    self_ident: ClientFileIdent,
    server_version_floor: ServerVersion,
    client_version_floor: ClientVersion,
    client_version_ceiling: ClientVersion,
    weak_server_order: bool,
) -> Result<(), ChangesetHeaderRule> {
    let mut server_version = server_version_floor;
    let mut client_version = client_version_floor;
    for changeset in changesets {
        let good_server_version = if weak_server_order {
            changeset.remote_version >= server_version
        } else {
            changeset.remote_version > server_version
        };
        if !good_server_version {
            return Err(ChangesetHeaderRule::BadServerVersion);
        }
        server_version = changeset.remote_version;

        let good_client_version = changeset.last_integrated_local_version >= client_version
            && changeset.last_integrated_local_version <= client_version_ceiling;
        if !good_client_version {
            return Err(ChangesetHeaderRule::BadClientVersion);
        }
        client_version = changeset.last_integrated_local_version;

        let good_file_ident = changeset.origin_file_ident > 0
            && changeset.origin_file_ident != self_ident.ident;
        if !good_file_ident {
            return Err(ChangesetHeaderRule::BadOriginFileIdent);
        }
    }
    Ok(())
}
