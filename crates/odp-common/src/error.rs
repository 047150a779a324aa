//! Error types for the import pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, OdpError>;

/// Main error type for the import pipeline
///
/// Failures are local to a message: a failed chunk never aborts sibling
/// chunks or other tables. The variant decides who retries: the external
/// scheduler for `SourceUnavailable`, the broker's dead-letter path for
/// `Load`, nobody for `ConsistencyMismatch`.
#[derive(Error, Debug)]
pub enum OdpError {
    #[error("upstream source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to parse table {table}: {reason}")]
    Parse { table: String, reason: String },

    #[error("failed to load chunk {sequence} of table {table}: {reason}")]
    Load {
        table: String,
        sequence: u32,
        reason: String,
    },

    #[error("consistency mismatch: expected {expected} rows, staging holds {actual}")]
    ConsistencyMismatch { expected: u64, actual: u64 },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
