//! Transform stage: parse one table file and fan out bounded chunks
//!
//! Rows are re-ordered into the table's registry column order by header
//! name; columns the file lacks become empty strings. A file that fails
//! to parse marks its table as skipped and is acknowledged; the run is
//! then rejected by the verifier, not retried forever.
//!
//! Counts are recorded before the first chunk is published, so the
//! completion barrier can never observe loaded chunks without an
//! expected total.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use odp_broker::{Envelope, QueueHandler};
use odp_common::{OdpError, Result, TableKind};

use crate::messages::{queues, SaveData, TransformData};
use crate::stages::StageContext;

pub struct TransformHandler {
    ctx: Arc<StageContext>,
}

impl TransformHandler {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl QueueHandler for TransformHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let msg: TransformData = envelope.decode()?;
        let ctx = &self.ctx;
        let table = msg.file.table;
        let path = msg.file.path.clone();

        let parsed =
            tokio::task::spawn_blocking(move || parse_table_file(&path, table)).await?;

        let rows = match parsed {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    version = %msg.version,
                    table = %table,
                    error = %e,
                    "table file failed to parse, skipping table"
                );
                ctx.catalog
                    .record_skipped(&msg.version, table, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let chunks = split_chunks(rows, ctx.config.chunk_size);
        let total_rows: usize = chunks.iter().map(Vec::len).sum();

        ctx.catalog
            .record_row_total(&msg.version, table, total_rows as u64)
            .await?;
        ctx.catalog
            .record_expected_chunks(&msg.version, table, chunks.len() as u64)
            .await?;

        // The transform owns the staging reset: a redelivered transform
        // message starts the table over instead of doubling its rows.
        ctx.tables.reset_staging(table).await?;

        for (sequence, rows) in chunks.into_iter().enumerate() {
            ctx.publisher.publish(
                &msg.version.dataset,
                queues::SAVE_DATA,
                &SaveData {
                    version: msg.version.clone(),
                    table,
                    sequence: sequence as u32,
                    rows,
                },
            )?;
        }

        info!(
            version = %msg.version,
            table = %table,
            rows = total_rows,
            "table transformed and chunked"
        );
        Ok(())
    }
}

/// Parse a CSV table file into registry-ordered rows
pub fn parse_table_file(path: &Path, table: TableKind) -> Result<Vec<Vec<String>>> {
    let parse_err = |reason: String| OdpError::Parse {
        table: table.table_name().to_string(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| parse_err(format!("cannot open file: {e}")))?;

    let headers = reader
        .headers()
        .map_err(|e| parse_err(format!("cannot read header row: {e}")))?
        .clone();

    let columns = table.columns();
    let mapping: Vec<Option<usize>> = columns
        .iter()
        .map(|column| headers.iter().position(|h| h == *column))
        .collect();

    if mapping.iter().all(Option::is_none) {
        return Err(parse_err("header row contains no recognized columns".to_string()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| parse_err(format!("malformed record: {e}")))?;
        let row = mapping
            .iter()
            .map(|index| {
                index
                    .and_then(|i| record.get(i))
                    .unwrap_or("")
                    .to_string()
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Split rows into chunks of at most `chunk_size`
pub fn split_chunks(rows: Vec<Vec<String>>, chunk_size: usize) -> Vec<Vec<Vec<String>>> {
    let mut chunks = Vec::with_capacity(rows.len().div_ceil(chunk_size.max(1)));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        chunks.push(rows.by_ref().take(chunk_size.max(1)).collect());
    }
    chunks
}
