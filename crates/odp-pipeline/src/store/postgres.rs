//! Postgres catalog and table store
//!
//! Metadata lives in a single `import_metadata` table keyed by
//! `(dataset, version, type, key)`. Count records rely on the unique
//! index for write-once semantics; the loaded-chunk counter uses an
//! upsert so concurrent loaders never lose an increment.
//!
//! Table names come from the static [`TableKind`] registry, so they are
//! safe to splice into SQL text; everything else is bound.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;

use odp_common::{DatasetVersion, OdpError, Result, TableKind};

use super::{record_type, Catalog, ImportOutcome, TableProgress, TableStore};

const LAST_MODIFIED_KEY: &str = "last_modified";
const PROMOTED_KEY: &str = "promoted";
const REJECTED_KEY: &str = "rejected";

fn store_err(e: sqlx::Error) -> OdpError {
    OdpError::Store(e.to_string())
}

/// Create the metadata table if it does not exist
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_metadata (
            id          BIGSERIAL PRIMARY KEY,
            dataset     TEXT NOT NULL,
            version     TEXT NOT NULL,
            type        TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (dataset, version, type, key)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;
    Ok(())
}

/// [`Catalog`] backed by the `import_metadata` table
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write-once insert; returns whether the row was new
    async fn insert_once(
        &self,
        version: &DatasetVersion,
        record_type: &str,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO import_metadata (dataset, version, type, key, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dataset, version, type, key) DO NOTHING
            "#,
        )
        .bind(&version.dataset)
        .bind(version.id())
        .bind(record_type)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_keyed(
        &self,
        version: &DatasetVersion,
        record_type: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM import_metadata
            WHERE dataset = $1 AND version = $2 AND type = $3
            "#,
        )
        .bind(&version.dataset)
        .bind(version.id())
        .bind(record_type)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }
}

fn parse_table(name: &str) -> Result<TableKind> {
    name.parse()
        .map_err(|_| OdpError::Store(format!("catalog holds unknown table name: {name}")))
}

fn parse_count(table: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| OdpError::Store(format!("non-numeric count for {table}: {value}")))
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn latest_last_modified(&self, dataset: &str) -> Result<Option<DateTime<Utc>>> {
        // Rejected versions are filtered out so they stay re-importable.
        let rows = sqlx::query(
            r#"
            SELECT m.value FROM import_metadata m
            WHERE m.dataset = $1 AND m.type = $2 AND m.key = $3
              AND NOT EXISTS (
                  SELECT 1 FROM import_metadata r
                  WHERE r.dataset = m.dataset AND r.version = m.version
                    AND r.type = $2 AND r.key = $4
              )
            "#,
        )
        .bind(dataset)
        .bind(record_type::DATASET_INFO)
        .bind(LAST_MODIFIED_KEY)
        .bind(REJECTED_KEY)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut latest = None;
        for row in rows {
            let value: String = row.get("value");
            let stamp = DateTime::parse_from_rfc3339(&value)
                .map_err(|e| OdpError::Store(format!("bad last_modified in catalog: {e}")))?
                .with_timezone(&Utc);
            if latest.is_none_or(|prev| stamp > prev) {
                latest = Some(stamp);
            }
        }
        Ok(latest)
    }

    async fn record_version(&self, version: &DatasetVersion) -> Result<()> {
        self.insert_once(
            version,
            record_type::DATASET_INFO,
            LAST_MODIFIED_KEY,
            &version.last_modified.to_rfc3339(),
        )
        .await?;
        Ok(())
    }

    async fn announce_table(&self, version: &DatasetVersion, table: TableKind) -> Result<()> {
        self.insert_once(version, record_type::TABLE_ANNOUNCED, table.table_name(), "")
            .await?;
        Ok(())
    }

    async fn announced_tables(&self, version: &DatasetVersion) -> Result<Vec<TableKind>> {
        self.fetch_keyed(version, record_type::TABLE_ANNOUNCED)
            .await?
            .into_iter()
            .map(|(key, _)| parse_table(&key))
            .collect()
    }

    async fn record_row_total(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        rows: u64,
    ) -> Result<()> {
        self.insert_once(
            version,
            record_type::TABLE_TOTAL_COUNT,
            table.table_name(),
            &rows.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn row_totals(&self, version: &DatasetVersion) -> Result<HashMap<TableKind, u64>> {
        self.fetch_keyed(version, record_type::TABLE_TOTAL_COUNT)
            .await?
            .into_iter()
            .map(|(key, value)| Ok((parse_table(&key)?, parse_count(&key, &value)?)))
            .collect()
    }

    async fn record_expected_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        chunks: u64,
    ) -> Result<()> {
        self.insert_once(
            version,
            record_type::TABLE_CHUNKS_EXPECTED,
            table.table_name(),
            &chunks.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn record_skipped(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        reason: &str,
    ) -> Result<()> {
        self.insert_once(version, record_type::TABLE_SKIPPED, table.table_name(), reason)
            .await?;
        Ok(())
    }

    async fn add_loaded_chunks(
        &self,
        version: &DatasetVersion,
        table: TableKind,
        delta: u64,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO import_metadata (dataset, version, type, key, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dataset, version, type, key)
            DO UPDATE SET value = ((import_metadata.value)::bigint + (EXCLUDED.value)::bigint)::text
            RETURNING value
            "#,
        )
        .bind(&version.dataset)
        .bind(version.id())
        .bind(record_type::TABLE_CHUNKS_LOADED)
        .bind(table.table_name())
        .bind(delta.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        let value: String = row.get("value");
        parse_count(table.table_name(), &value)
    }

    async fn table_progress(&self, version: &DatasetVersion) -> Result<Vec<TableProgress>> {
        let announced = self.announced_tables(version).await?;

        let mut expected = HashMap::new();
        for (key, value) in self
            .fetch_keyed(version, record_type::TABLE_CHUNKS_EXPECTED)
            .await?
        {
            expected.insert(parse_table(&key)?, parse_count(&key, &value)?);
        }

        let mut loaded = HashMap::new();
        for (key, value) in self
            .fetch_keyed(version, record_type::TABLE_CHUNKS_LOADED)
            .await?
        {
            loaded.insert(parse_table(&key)?, parse_count(&key, &value)?);
        }

        let mut skipped = Vec::new();
        for (key, _) in self.fetch_keyed(version, record_type::TABLE_SKIPPED).await? {
            skipped.push(parse_table(&key)?);
        }

        Ok(announced
            .into_iter()
            .map(|table| TableProgress {
                table,
                expected_chunks: expected.get(&table).copied(),
                loaded_chunks: loaded.get(&table).copied().unwrap_or(0),
                skipped: skipped.contains(&table),
            })
            .collect())
    }

    async fn record_outcome(
        &self,
        version: &DatasetVersion,
        outcome: &ImportOutcome,
    ) -> Result<()> {
        let (key, value) = match outcome {
            ImportOutcome::Promoted => (PROMOTED_KEY, String::new()),
            ImportOutcome::Rejected(reason) => (REJECTED_KEY, reason.clone()),
        };
        self.insert_once(version, record_type::DATASET_INFO, key, &value)
            .await?;
        Ok(())
    }

    async fn outcome(&self, version: &DatasetVersion) -> Result<Option<ImportOutcome>> {
        for (key, value) in self.fetch_keyed(version, record_type::DATASET_INFO).await? {
            match key.as_str() {
                PROMOTED_KEY => return Ok(Some(ImportOutcome::Promoted)),
                REJECTED_KEY => return Ok(Some(ImportOutcome::Rejected(value))),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn clear_version(&self, version: &DatasetVersion) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM import_metadata
            WHERE dataset = $1 AND version = $2
            "#,
        )
        .bind(&version.dataset)
        .bind(version.id())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(
            version = %version,
            cleared = result.rows_affected(),
            "cleared version metadata for retry"
        );
        Ok(result.rows_affected())
    }

    async fn purge_stale_versions(&self, keep: &DatasetVersion) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM import_metadata
            WHERE dataset = $1 AND version <> $2
            "#,
        )
        .bind(&keep.dataset)
        .bind(keep.id())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(
            dataset = %keep.dataset,
            purged = result.rows_affected(),
            "purged stale version metadata"
        );
        Ok(result.rows_affected())
    }
}

/// [`TableStore`] backed by plain Postgres tables
///
/// Every registry column is TEXT; the import is a faithful copy of the
/// upstream CSV, typed views live downstream.
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn create_sql(name: &str, table: TableKind, if_not_exists: bool) -> String {
        let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
        let columns = table
            .columns()
            .iter()
            .map(|c| format!("{c} TEXT"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {guard}\"{name}\" ({columns})")
    }

    async fn count(&self, name: &str) -> Result<u64> {
        // to_regclass avoids an error path for tables that were never created
        let exists = sqlx::query("SELECT to_regclass($1)::text AS oid")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        if exists.get::<Option<String>, _>("oid").is_none() {
            return Ok(0);
        }

        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM \"{name}\""))
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn reset_staging(&self, table: TableKind) -> Result<()> {
        let name = table.staging_name();
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query(&Self::create_sql(&name, table, false))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn ensure_staging(&self, table: TableKind) -> Result<()> {
        sqlx::query(&Self::create_sql(&table.staging_name(), table, true))
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn insert_chunk(&self, table: TableKind, rows: &[Vec<String>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = table.columns();
        let column_list = columns.join(", ");
        let mut placeholders = Vec::with_capacity(rows.len());
        let mut arg = 1;
        for _ in rows {
            let tuple = (0..columns.len())
                .map(|_| {
                    let p = format!("${arg}");
                    arg += 1;
                    p
                })
                .collect::<Vec<_>>()
                .join(", ");
            placeholders.push(format!("({tuple})"));
        }

        let sql = format!(
            "INSERT INTO \"{}\" ({column_list}) VALUES {}",
            table.staging_name(),
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for row in rows {
            for i in 0..columns.len() {
                query = query.bind(row.get(i).map(String::as_str).unwrap_or(""));
            }
        }

        let result = query.execute(&self.pool).await.map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn staging_count(&self, table: TableKind) -> Result<u64> {
        self.count(&table.staging_name()).await
    }

    async fn production_count(&self, table: TableKind) -> Result<u64> {
        self.count(table.table_name()).await
    }

    async fn promote(&self, tables: &[TableKind]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for table in tables {
            let production = table.table_name();
            let staging = table.staging_name();
            let retired = table.retired_name();

            sqlx::query(&format!("DROP TABLE IF EXISTS \"{retired}\""))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            sqlx::query(&format!(
                "ALTER TABLE IF EXISTS \"{production}\" RENAME TO \"{retired}\""
            ))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            // No IF EXISTS here: a missing staging table must abort the
            // whole transaction and leave production in place.
            sqlx::query(&format!(
                "ALTER TABLE \"{staging}\" RENAME TO \"{production}\""
            ))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{retired}\""))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}
