//! Server endpoint identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The protocol envelope of an endpoint URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolEnvelope {
    /// Plain WebSocket (`ws://`).
    Ws,
    /// TLS WebSocket (`wss://`).
    Wss,
    /// Scheme alias resolving to plain WebSocket.
    Sync,
    /// Scheme alias resolving to TLS WebSocket.
    Syncs,
}

impl ProtocolEnvelope {
    pub fn is_tls(self) -> bool {
        matches!(self, ProtocolEnvelope::Wss | ProtocolEnvelope::Syncs)
    }

    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "ws" => Some(ProtocolEnvelope::Ws),
            "wss" => Some(ProtocolEnvelope::Wss),
            "sync" => Some(ProtocolEnvelope::Sync),
            "syncs" => Some(ProtocolEnvelope::Syncs),
            _ => None,
        }
    }
}

/// The identity of one sync server endpoint.
///
/// Connections are shared between sessions whose endpoints compare equal,
/// so everything that affects transport-level reachability is part of the
/// key and nothing else is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub envelope: ProtocolEnvelope,
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(envelope: ProtocolEnvelope, host: impl Into<String>, port: u16) -> Self {
        Self {
            envelope,
            host: host.into(),
            port,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.envelope.is_tls()
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.envelope {
            ProtocolEnvelope::Ws => "ws",
            ProtocolEnvelope::Wss => "wss",
            ProtocolEnvelope::Sync => "sync",
            ProtocolEnvelope::Syncs => "syncs",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}
