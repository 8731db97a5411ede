//! Caller-facing configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::backoff::ReconnectMode;
use crate::core::Limits;

/// Whether and how user metadata is persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMode {
    /// No metadata file; users and file actions live in memory only.
    None,
    #[default]
    Plain,
    Encrypted,
}

/// Close semantics for a session handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    #[default]
    Immediate,
    LiveIndefinitely,
    AfterChangesUploaded,
}

/// Client-reset policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientResyncMode {
    /// Surface the error; the application handles the reset itself.
    Manual,
    /// Replace local state with the fresh server copy.
    DiscardLocal,
    /// Merge unsynced local writes into the fresh copy.
    #[default]
    Recover,
    /// Try recovery, fall back to discarding.
    RecoverOrDiscard,
}

/// Engine-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root directory for databases, metadata, and recovery files.
    pub base_file_path: PathBuf,
    pub metadata_mode: MetadataMode,
    #[serde(skip)]
    pub reconnect_mode: ReconnectMode,
    /// Share one connection per endpoint across sessions.
    pub multiplex_sessions: bool,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connection_linger_time: Duration,
    #[serde(with = "duration_ms")]
    pub ping_keepalive_period: Duration,
    #[serde(with = "duration_ms")]
    pub pong_keepalive_timeout: Duration,
    /// Disconnects shorter than this let sessions skip a MARK round trip.
    #[serde(with = "duration_ms")]
    pub fast_reconnect_limit: Duration,
    pub limits: Limits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_file_path: PathBuf::from("."),
            metadata_mode: MetadataMode::default(),
            reconnect_mode: ReconnectMode::Normal,
            multiplex_sessions: true,
            connect_timeout: Duration::from_secs(120),
            connection_linger_time: Duration::from_secs(30),
            ping_keepalive_period: Duration::from_secs(60),
            pong_keepalive_timeout: Duration::from_secs(120),
            fast_reconnect_limit: Duration::from_secs(60),
            limits: Limits::default(),
        }
    }
}

/// Per-session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server path for partition-based sync; ignored for flexible sync.
    pub partition: Option<String>,
    /// Flexible sync when true: queries drive the synchronized subset.
    pub flexible_sync: bool,
    pub stop_policy: StopPolicy,
    pub client_resync_mode: ClientResyncMode,
    /// Resolve pending waits with an error on any non-fatal protocol error.
    pub cancel_waits_on_nonfatal_error: bool,
    /// Chunk size when draining pending bootstraps into the database.
    pub flx_bootstrap_batch_size_bytes: usize,
    pub ssl_trust_certificate_path: Option<PathBuf>,
    pub proxy_config: Option<ProxyConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            partition: None,
            flexible_sync: false,
            stop_policy: StopPolicy::default(),
            client_resync_mode: ClientResyncMode::default(),
            cancel_waits_on_nonfatal_error: false,
            flx_bootstrap_batch_size_bytes: 1024 * 1024,
            ssl_trust_certificate_path: None,
            proxy_config: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}
