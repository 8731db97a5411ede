//! WebSocket sub-protocol token negotiation.
//!
//! The client advertises one token per supported protocol version, newest
//! first, so a conforming server picks the highest version both sides speak.
//! The accepted token echoed in the upgrade response is parsed back; a token
//! outside the advertised range is fatal.

use thiserror::Error;

use super::messages::{PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};

const PBS_PROTOCOL_PREFIX: &str = "io.driftwire.sync/";
const FLX_PROTOCOL_PREFIX: &str = "io.driftwire.flx-sync/";

/// Which sync flavor a connection speaks; decides the token prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncFlavor {
    PartitionBased,
    Flexible,
}

impl SyncFlavor {
    fn prefix(self) -> &'static str {
        match self {
            SyncFlavor::PartitionBased => PBS_PROTOCOL_PREFIX,
            SyncFlavor::Flexible => FLX_PROTOCOL_PREFIX,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("server selected no sub-protocol")]
    NoneSelected,
    #[error("server selected malformed sub-protocol {0:?}")]
    Malformed(String),
    #[error("server selected unsupported protocol version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },
}

/// Tokens to advertise on the WebSocket upgrade, descending by version.
pub fn advertised_protocols(flavor: SyncFlavor) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut version = PROTOCOL_VERSION_MAX;
    while version >= PROTOCOL_VERSION_MIN {
        tokens.push(format!("{}{}", flavor.prefix(), version));
        version -= 1;
    }
    tokens
}

/// Parses the sub-protocol the server accepted and returns the negotiated
/// version.
pub fn parse_selected_protocol(
    selected: Option<&str>,
    flavor: SyncFlavor,
) -> Result<u32, NegotiateError> {
    let selected = selected.ok_or(NegotiateError::NoneSelected)?;
    let version = selected
        .strip_prefix(flavor.prefix())
        .and_then(|raw| raw.parse::<u32>().ok())
        .ok_or_else(|| NegotiateError::Malformed(selected.to_string()))?;
    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&version) {
        return Err(NegotiateError::UnsupportedVersion {
            version,
            min: PROTOCOL_VERSION_MIN,
            max: PROTOCOL_VERSION_MAX,
        });
    }
    Ok(version)
}
