//! Load stage: append one chunk into the table's staging copy
//!
//! Insert-only. Delivery is at-least-once, so a redelivered chunk lands
//! twice; the verifier's exact-match gate catches the surplus and fails
//! the run closed rather than promoting silently wrong data.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use odp_broker::{Envelope, QueueHandler};
use odp_common::OdpError;

use crate::messages::SaveData;
use crate::stages::StageContext;

pub struct LoadHandler {
    ctx: Arc<StageContext>,
}

impl LoadHandler {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl QueueHandler for LoadHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let msg: SaveData = envelope.decode()?;
        let ctx = &self.ctx;

        // Loaders only ensure the staging table exists; resetting it is
        // the transform stage's job. A chunk arriving before its sibling
        // must not wipe rows a faster loader already wrote.
        ctx.tables.ensure_staging(msg.table).await?;
        let inserted = ctx
            .tables
            .insert_chunk(msg.table, &msg.rows)
            .await
            .map_err(|e| OdpError::Load {
                table: msg.table.table_name().to_string(),
                sequence: msg.sequence,
                reason: e.to_string(),
            })?;
        let loaded = ctx
            .catalog
            .add_loaded_chunks(&msg.version, msg.table, 1)
            .await?;

        debug!(
            version = %msg.version,
            table = %msg.table,
            sequence = msg.sequence,
            rows = inserted,
            chunks_loaded = loaded,
            "chunk staged"
        );
        Ok(())
    }
}
