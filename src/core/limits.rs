//! Internal safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Caps the engine enforces regardless of configuration.
///
/// Values are explicit about their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_changesets_per_download: usize,
    pub max_changesets_per_upload: usize,
    pub max_upload_message_bytes: usize,

    pub max_pending_bootstrap_bytes: usize,
    pub max_pending_bootstrap_changesets: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_string_bytes: usize,

    pub max_grouped_commits: usize,
    pub max_queued_async_writes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_changesets_per_download: 10_000,
            max_changesets_per_upload: 1_000,
            max_upload_message_bytes: 16 * 1024 * 1024,

            max_pending_bootstrap_bytes: 128 * 1024 * 1024,
            max_pending_bootstrap_changesets: 100_000,

            max_cbor_depth: 16,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 100_000,
            max_cbor_string_bytes: 16 * 1024 * 1024,

            max_grouped_commits: 20,
            max_queued_async_writes: 1024,
        }
    }
}
