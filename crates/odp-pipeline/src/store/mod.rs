//! Metadata catalog and table store
//!
//! The only shared mutable state in the pipeline. Both are traits with
//! explicit handles passed into each stage, so tests run against the
//! in-memory backend and deployments against Postgres.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odp_common::{DatasetVersion, Result, TableKind};

pub use memory::{MemoryCatalog, MemoryTableStore};
pub use postgres::{PgCatalog, PgTableStore};

/// Metadata record types stored per `(dataset, version, type, key)`
pub mod record_type {
    /// Total parsed rows for a table, written once by the transform stage
    pub const TABLE_TOTAL_COUNT: &str = "TABLE_TOTAL_COUNT";
    /// Chunk messages the transform stage published for a table
    pub const TABLE_CHUNKS_EXPECTED: &str = "TABLE_CHUNKS_EXPECTED";
    /// Chunk messages the load stage has settled for a table
    pub const TABLE_CHUNKS_LOADED: &str = "TABLE_CHUNKS_LOADED";
    /// Marker for a table whose file failed to parse; never carries a count
    pub const TABLE_SKIPPED: &str = "TABLE_SKIPPED";
    /// Marker written by the connector for every table in the snapshot
    pub const TABLE_ANNOUNCED: &str = "TABLE_ANNOUNCED";
    /// Version-level info: `last_modified`, `promoted`, `rejected`
    pub const DATASET_INFO: &str = "DATASET_INFO";
}

/// Terminal result of an import run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Promoted,
    Rejected(String),
}

/// Barrier view of one announced table
#[derive(Debug, Clone)]
pub struct TableProgress {
    pub table: TableKind,
    /// Chunk count recorded by the transform stage, if it ran
    pub expected_chunks: Option<u64>,
    pub loaded_chunks: u64,
    /// Parse failure marker; the table will never produce chunks
    pub skipped: bool,
}

impl TableProgress {
    /// Whether the fan-out for this table has drained
    pub fn resolved(&self) -> bool {
        self.skipped || self.expected_chunks.is_some_and(|e| self.loaded_chunks >= e)
    }
}

/// Shared metadata store keyed by dataset version
///
/// Count records are written once and never mutated for a version; only
/// the loaded-chunk counter is incremented, and only atomically. Stale
/// versions are deleted wholesale after a successful promotion.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Newest recorded last-modified timestamp for a dataset, across its
    /// versions. Rejected versions are excluded: a rejected snapshot must
    /// stay eligible for re-import, so it never advances the freshness
    /// baseline.
    async fn latest_last_modified(&self, dataset: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record a freshly fetched version (its `last_modified` info row)
    async fn record_version(&self, version: &DatasetVersion) -> Result<()>;

    /// Announce a table found in the snapshot
    async fn announce_table(&self, version: &DatasetVersion, table: TableKind) -> Result<()>;

    /// Every table announced for a version
    async fn announced_tables(&self, version: &DatasetVersion) -> Result<Vec<TableKind>>;

    /// Write a table's total parsed row count (write-once)
    async fn record_row_total(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        rows: u64,
    ) -> Result<()>;

    /// Row totals for every table that recorded one
    async fn row_totals(&self, version: &DatasetVersion) -> Result<HashMap<TableKind, u64>>;

    /// Write a table's expected chunk count (write-once)
    async fn record_expected_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        chunks: u64,
    ) -> Result<()>;

    /// Mark a table as skipped after a parse failure
    async fn record_skipped(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        reason: &str,
    ) -> Result<()>;

    /// Atomically bump a table's loaded-chunk counter, returning the new value
    async fn add_loaded_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        delta: u64,
    ) -> Result<u64>;

    /// Progress of every announced table, for the completion barrier
    async fn table_progress(&self, version: &DatasetVersion) -> Result<Vec<TableProgress>>;

    /// Record the terminal outcome of a run
    async fn record_outcome(
        &self,
        version: &DatasetVersion,
        outcome: &ImportOutcome,
    ) -> Result<()>;

    /// Terminal outcome, if the run has settled
    async fn outcome(&self, version: &DatasetVersion) -> Result<Option<ImportOutcome>>;

    /// Delete every metadata record of one version, returning how many
    /// records were removed. Used to retry a rejected run from a clean
    /// slate; the write-once records and the rejected marker would
    /// otherwise pin the stale state.
    async fn clear_version(&self, version: &DatasetVersion) -> Result<u64>;

    /// Delete metadata of every other version of the same dataset,
    /// returning how many records were removed
    async fn purge_stale_versions(&self, keep: &DatasetVersion) -> Result<u64>;
}

/// Staging and production tables for the whitelisted table set
///
/// Production tables are only ever replaced whole by [`TableStore::promote`];
/// staging tables are write-only until then.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Recreate the staging table empty
    async fn reset_staging(&self, table: TableKind) -> Result<()>;

    /// Create the staging table if it does not exist, keeping its rows
    async fn ensure_staging(&self, table: TableKind) -> Result<()>;

    /// Insert-only append of a chunk; duplicates are accepted
    async fn insert_chunk(&self, table: TableKind, rows: &[Vec<String>]) -> Result<u64>;

    /// Rows currently in the staging table (0 if it was never created)
    async fn staging_count(&self, table: TableKind) -> Result<u64>;

    /// Rows currently in the production table (0 if absent)
    async fn production_count(&self, table: TableKind) -> Result<u64>;

    /// Atomically retire production and rename staging into its place,
    /// for every given table, as one transaction
    async fn promote(&self, tables: &[TableKind]) -> Result<()>;
}
