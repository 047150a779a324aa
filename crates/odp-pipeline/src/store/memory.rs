//! In-memory catalog and table store
//!
//! Backing store for local dry runs (`--store memory`) and the test
//! suites. Promotion is atomic under a single lock, matching the
//! transactional rename the Postgres backend performs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odp_common::{DatasetVersion, OdpError, Result, TableKind};

use super::{Catalog, ImportOutcome, TableProgress, TableStore};

#[derive(Default)]
struct VersionState {
    announced: Vec<TableKind>,
    row_totals: HashMap<TableKind, u64>,
    expected_chunks: HashMap<TableKind, u64>,
    loaded_chunks: HashMap<TableKind, u64>,
    skipped: HashMap<TableKind, String>,
    outcome: Option<ImportOutcome>,
}

/// In-memory [`Catalog`]
#[derive(Default)]
pub struct MemoryCatalog {
    // Keyed by version id; the DatasetVersion is kept for purge scans.
    inner: Mutex<HashMap<String, (DatasetVersion, VersionState)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_version<T>(
        &self,
        version: &DatasetVersion,
        f: impl FnOnce(&mut VersionState) -> T,
    ) -> T {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let (_, state) = inner
            .entry(version.id())
            .or_insert_with(|| (version.clone(), VersionState::default()));
        f(state)
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn latest_last_modified(&self, dataset: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        Ok(inner
            .values()
            .filter(|(v, state)| {
                v.dataset == dataset
                    && !matches!(state.outcome, Some(ImportOutcome::Rejected(_)))
            })
            .map(|(v, _)| v.last_modified)
            .max())
    }

    async fn record_version(&self, version: &DatasetVersion) -> Result<()> {
        self.with_version(version, |_| ());
        Ok(())
    }

    async fn announce_table(&self, version: &DatasetVersion, table: TableKind) -> Result<()> {
        self.with_version(version, |state| {
            if !state.announced.contains(&table) {
                state.announced.push(table);
            }
        });
        Ok(())
    }

    async fn announced_tables(&self, version: &DatasetVersion) -> Result<Vec<TableKind>> {
        Ok(self.with_version(version, |state| state.announced.clone()))
    }

    async fn record_row_total(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        rows: u64,
    ) -> Result<()> {
        self.with_version(version, |state| {
            state.row_totals.entry(table).or_insert(rows);
        });
        Ok(())
    }

    async fn row_totals(&self, version: &DatasetVersion) -> Result<HashMap<TableKind, u64>> {
        Ok(self.with_version(version, |state| state.row_totals.clone()))
    }

    async fn record_expected_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        chunks: u64,
    ) -> Result<()> {
        self.with_version(version, |state| {
            state.expected_chunks.entry(table).or_insert(chunks);
        });
        Ok(())
    }

    async fn record_skipped(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        reason: &str,
    ) -> Result<()> {
        self.with_version(version, |state| {
            state.skipped.entry(table).or_insert_with(|| reason.to_string());
        });
        Ok(())
    }

    async fn add_loaded_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        delta: u64,
    ) -> Result<u64> {
        Ok(self.with_version(version, |state| {
            let counter = state.loaded_chunks.entry(table).or_insert(0);
            *counter += delta;
            *counter
        }))
    }

    async fn table_progress(&self, version: &DatasetVersion) -> Result<Vec<TableProgress>> {
        Ok(self.with_version(version, |state| {
            state
                .announced
                .iter()
                .map(|&table| TableProgress {
                    table,
                    expected_chunks: state.expected_chunks.get(&table).copied(),
                    loaded_chunks: state.loaded_chunks.get(&table).copied().unwrap_or(0),
                    skipped: state.skipped.contains_key(&table),
                })
                .collect()
        }))
    }

    async fn record_outcome(
        &self,
        version: &DatasetVersion,
        outcome: &ImportOutcome,
    ) -> Result<()> {
        self.with_version(version, |state| {
            if state.outcome.is_none() {
                state.outcome = Some(outcome.clone());
            }
        });
        Ok(())
    }

    async fn outcome(&self, version: &DatasetVersion) -> Result<Option<ImportOutcome>> {
        Ok(self.with_version(version, |state| state.outcome.clone()))
    }

    async fn clear_version(&self, version: &DatasetVersion) -> Result<u64> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        Ok(inner.remove(&version.id()).map(|_| 1).unwrap_or(0))
    }

    async fn purge_stale_versions(&self, keep: &DatasetVersion) -> Result<u64> {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        let keep_id = keep.id();
        let before = inner.len();
        inner.retain(|id, (v, _)| v.dataset != keep.dataset || *id == keep_id);
        Ok((before - inner.len()) as u64)
    }
}

/// In-memory [`TableStore`]
///
/// Relations are keyed by their physical name, so the staging/production
/// naming convention behaves exactly as it does in Postgres.
#[derive(Default)]
pub struct MemoryTableStore {
    relations: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production rows, for assertions in tests
    pub fn production_rows(&self, table: TableKind) -> Vec<Vec<String>> {
        let relations = self.relations.lock().expect("table store lock poisoned");
        relations
            .get(table.table_name())
            .cloned()
            .unwrap_or_default()
    }

    /// Seed a production table, simulating previously promoted data
    pub fn seed_production(&self, table: TableKind, rows: Vec<Vec<String>>) {
        let mut relations = self.relations.lock().expect("table store lock poisoned");
        relations.insert(table.table_name().to_string(), rows);
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn reset_staging(&self, table: TableKind) -> Result<()> {
        let mut relations = self.relations.lock().expect("table store lock poisoned");
        relations.insert(table.staging_name(), Vec::new());
        Ok(())
    }

    async fn ensure_staging(&self, table: TableKind) -> Result<()> {
        let mut relations = self.relations.lock().expect("table store lock poisoned");
        relations.entry(table.staging_name()).or_default();
        Ok(())
    }

    async fn insert_chunk(&self, table: TableKind, rows: &[Vec<String>]) -> Result<u64> {
        let mut relations = self.relations.lock().expect("table store lock poisoned");
        let staging = relations
            .get_mut(&table.staging_name())
            .ok_or_else(|| OdpError::Store(format!("staging table {} missing", table.staging_name())))?;
        staging.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn staging_count(&self, table: TableKind) -> Result<u64> {
        let relations = self.relations.lock().expect("table store lock poisoned");
        Ok(relations
            .get(&table.staging_name())
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn production_count(&self, table: TableKind) -> Result<u64> {
        let relations = self.relations.lock().expect("table store lock poisoned");
        Ok(relations
            .get(table.table_name())
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn promote(&self, tables: &[TableKind]) -> Result<()> {
        let mut relations = self.relations.lock().expect("table store lock poisoned");

        // Validate the whole batch before touching anything, so a failed
        // promotion leaves production untouched, like the SQL transaction.
        for table in tables {
            if !relations.contains_key(&table.staging_name()) {
                return Err(OdpError::Store(format!(
                    "cannot promote {}: staging table missing",
                    table
                )));
            }
        }

        for table in tables {
            let staged = relations
                .remove(&table.staging_name())
                .expect("validated above");
            relations.insert(table.table_name().to_string(), staged);
        }

        Ok(())
    }
}
