//! Typed broker messages
//!
//! One message type per stage queue. Bodies travel as UTF-8 JSON; every
//! field a stage needs is in the payload or the catalog, never in
//! process-local state.

use odp_common::{DatasetVersion, RawFileDescriptor, TableKind};
use serde::{Deserialize, Serialize};

/// Stage queue names, 1:1 with the operator commands
pub mod queues {
    pub const DOWNLOAD_FILES: &str = "download_files";
    pub const TRANSFORM_DATA: &str = "transform_data";
    pub const SAVE_DATA: &str = "save_data";
    pub const CHECK_DONE: &str = "check_done";
    pub const DEAD_LETTER: &str = "dead_letter";
}

/// Ask the connector to pull a snapshot of a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFiles {
    pub dataset: String,
}

/// One whitelisted table file awaiting transformation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformData {
    pub version: DatasetVersion,
    pub file: RawFileDescriptor,
}

/// One bounded chunk of parsed rows for the load stage
///
/// Rows are ordered and aligned with the table's registry columns.
/// Delivery is at-least-once; the loader appends without deduplicating
/// and the verifier catches any surplus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveData {
    pub version: DatasetVersion,
    pub table: TableKind,
    pub sequence: u32,
    pub rows: Vec<Vec<String>>,
}

/// Self-requeuing completion poll for one dataset version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDone {
    pub version: DatasetVersion,
    pub attempt: u32,
}
