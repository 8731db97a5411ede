//! Version and identity primitives for the sync protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the client-side history.
///
/// Version 0 denotes the empty history before the first commit.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientVersion(u64);

impl ClientVersion {
    pub const ZERO: ClientVersion = ClientVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> ClientVersion {
        ClientVersion(
            self.0
                .checked_add(1)
                .expect("client version overflow computing next"),
        )
    }
}

impl fmt::Debug for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientVersion({})", self.0)
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ClientVersion> for u64 {
    fn from(value: ClientVersion) -> u64 {
        value.0
    }
}

/// A position in the server-side history.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ServerVersion(u64);

impl ServerVersion {
    pub const ZERO: ServerVersion = ServerVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerVersion({})", self.0)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ServerVersion> for u64 {
    fn from(value: ServerVersion) -> u64 {
        value.0
    }
}

/// A server version together with the salt the server minted for it.
///
/// The salt disambiguates server histories that were rebuilt (e.g. after a
/// server-side compaction) and therefore reuse version numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedServerVersion {
    pub version: ServerVersion,
    pub salt: i64,
}

impl SaltedServerVersion {
    pub fn new(version: ServerVersion, salt: i64) -> Self {
        Self { version, salt }
    }
}

/// The server-assigned identity of one client file.
///
/// Assigned exactly once, on the first IDENT message from the server, and
/// immutable afterwards except through a client reset. `ident` is strictly
/// positive and `salt` is non-zero for any assigned identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientFileIdent {
    pub ident: u64,
    pub salt: i64,
}

impl ClientFileIdent {
    /// The unassigned identity, used before the server has issued one.
    pub const UNASSIGNED: ClientFileIdent = ClientFileIdent { ident: 0, salt: 0 };

    pub fn new(ident: u64, salt: i64) -> Self {
        Self { ident, salt }
    }

    pub fn is_assigned(&self) -> bool {
        self.ident != 0
    }
}

impl Default for ClientFileIdent {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl fmt::Debug for ClientFileIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientFileIdent({}, salt={})", self.ident, self.salt)
    }
}

impl fmt::Display for ClientFileIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ident)
    }
}

/// Identifies one session multiplexed on a connection. Zero addresses the
/// connection itself in server-to-client ERROR messages.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionIdent(u64);

impl SessionIdent {
    pub const CONNECTION: SessionIdent = SessionIdent(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one MARK round trip within a session.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestIdent(u64);

impl RequestIdent {
    pub const ZERO: RequestIdent = RequestIdent(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> RequestIdent {
        RequestIdent(
            self.0
                .checked_add(1)
                .expect("request ident overflow computing next"),
        )
    }
}

impl fmt::Display for RequestIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a subscription set in flexible sync. Version 0 is the empty
/// initial set every file starts with.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QueryVersion(i64);

impl QueryVersion {
    pub const ZERO: QueryVersion = QueryVersion(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> QueryVersion {
        QueryVersion(
            self.0
                .checked_add(1)
                .expect("query version overflow computing next"),
        )
    }
}

impl fmt::Display for QueryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
