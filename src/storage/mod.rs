//! Local persistence: the embedded-database seam and the history sidecar.

pub mod db;
pub mod history;

pub use db::{DbError, MemoryDb, Snapshot, WriteTransaction};
pub use history::{HistoryError, ResetKind, ResetMarker, SqliteHistory};
