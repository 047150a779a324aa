//! Consistency verification and blue-green promotion
//!
//! The verifier is the only writer of production tables. It compares
//! each announced table's recorded row total against the rows that
//! actually reached staging; any deficit or surplus rejects the whole
//! version and leaves production untouched. On an exact match, every
//! staging table is renamed into production in one transaction and the
//! metadata of older versions is purged.

use std::sync::Arc;

use tracing::{info, warn};

use odp_common::{DatasetVersion, OdpError, Result};

use crate::store::{Catalog, ImportOutcome, TableStore};

/// Result of one verification pass
#[derive(Debug)]
pub enum VerifyOutcome {
    /// The run had already settled; nothing was done
    AlreadySettled(ImportOutcome),
    /// All tables matched and were promoted
    Promoted { tables: usize, rows: u64 },
    /// The version was rejected; staging remains for inspection
    Rejected { reason: String },
}

pub struct Verifier {
    catalog: Arc<dyn Catalog>,
    tables: Arc<dyn TableStore>,
}

impl Verifier {
    pub fn new(catalog: Arc<dyn Catalog>, tables: Arc<dyn TableStore>) -> Self {
        Self { catalog, tables }
    }

    /// Verify a drained version and promote it on an exact count match
    ///
    /// Idempotent: a settled version short-circuits, so a duplicate
    /// barrier delivery can never promote twice or flip an outcome.
    pub async fn verify(&self, version: &DatasetVersion) -> Result<VerifyOutcome> {
        if let Some(outcome) = self.catalog.outcome(version).await? {
            return Ok(VerifyOutcome::AlreadySettled(outcome));
        }

        let announced = self.catalog.announced_tables(version).await?;
        if announced.is_empty() {
            return self
                .reject(version, "snapshot announced no tables".to_string())
                .await;
        }

        let totals = self.catalog.row_totals(version).await?;
        let mut total_rows = 0u64;

        for &table in &announced {
            let Some(&expected) = totals.get(&table) else {
                // No total means the file never parsed or the transform
                // message was lost; either way the snapshot is incomplete.
                return self
                    .reject(version, format!("table {table} has no recorded row total"))
                    .await;
            };

            let staged = self.tables.staging_count(table).await?;
            if staged != expected {
                let mismatch = OdpError::ConsistencyMismatch {
                    expected,
                    actual: staged,
                };
                return self.reject(version, format!("table {table}: {mismatch}")).await;
            }
            total_rows += staged;
        }

        info!(
            version = %version,
            tables = announced.len(),
            rows = total_rows,
            "all tables verified, promoting"
        );

        self.tables.promote(&announced).await?;
        self.catalog
            .record_outcome(version, &ImportOutcome::Promoted)
            .await?;
        self.catalog.purge_stale_versions(version).await?;

        info!(version = %version, "version promoted to production");
        Ok(VerifyOutcome::Promoted {
            tables: announced.len(),
            rows: total_rows,
        })
    }

    async fn reject(&self, version: &DatasetVersion, reason: String) -> Result<VerifyOutcome> {
        warn!(version = %version, %reason, "rejecting version, production unchanged");
        self.catalog
            .record_outcome(version, &ImportOutcome::Rejected(reason.clone()))
            .await?;
        Ok(VerifyOutcome::Rejected { reason })
    }
}

impl VerifyOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::Promoted { .. }
                | VerifyOutcome::AlreadySettled(ImportOutcome::Promoted)
        )
    }
}
