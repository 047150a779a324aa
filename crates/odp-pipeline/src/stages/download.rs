//! Connector stage: fetch the snapshot and fan out transform work
//!
//! Skips the import when the upstream archive is not newer than the
//! newest version already in the catalog. Otherwise it records the new
//! version, announces every whitelisted table found in the archive, and
//! ends by scheduling the completion barrier for the version.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use odp_broker::{Envelope, QueueHandler};

use crate::messages::{queues, CheckDone, DownloadFiles, TransformData};
use crate::stages::StageContext;
use crate::store::ImportOutcome;

pub struct DownloadHandler {
    ctx: Arc<StageContext>,
}

impl DownloadHandler {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl QueueHandler for DownloadHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let msg: DownloadFiles = envelope.decode()?;
        let ctx = &self.ctx;

        if msg.dataset != ctx.source.dataset() {
            anyhow::bail!(
                "connector is configured for dataset '{}', got '{}'",
                ctx.source.dataset(),
                msg.dataset
            );
        }

        let latest = ctx.catalog.latest_last_modified(&msg.dataset).await?;

        // Cheap freshness probe before committing to the full download.
        if let (Some(remote), Some(latest)) = (ctx.source.fetch_last_modified().await?, latest) {
            if remote <= latest {
                info!(
                    dataset = %msg.dataset,
                    %remote,
                    %latest,
                    "upstream snapshot is not newer, skipping import"
                );
                return Ok(());
            }
        }

        let snapshot = ctx.source.fetch_snapshot().await?;

        // The archive's own stamp is authoritative; re-check in case the
        // MDTM probe was unavailable or the file changed mid-flight.
        if let Some(latest) = latest {
            if snapshot.version.last_modified <= latest {
                info!(version = %snapshot.version, "snapshot already imported, skipping");
                return Ok(());
            }
        }

        // A previously rejected run of this snapshot starts over from a
        // clean slate; its write-once records and rejected marker would
        // otherwise short-circuit the barrier and pin stale counts.
        if let Some(ImportOutcome::Rejected(reason)) =
            ctx.catalog.outcome(&snapshot.version).await?
        {
            warn!(version = %snapshot.version, %reason, "retrying previously rejected run");
            ctx.catalog.clear_version(&snapshot.version).await?;
        }

        ctx.catalog.record_version(&snapshot.version).await?;

        for file in &snapshot.files {
            ctx.catalog
                .announce_table(&snapshot.version, file.table)
                .await?;
            ctx.publisher.publish(
                &msg.dataset,
                queues::TRANSFORM_DATA,
                &TransformData {
                    version: snapshot.version.clone(),
                    file: file.clone(),
                },
            )?;
        }

        info!(
            version = %snapshot.version,
            tables = snapshot.files.len(),
            "snapshot dispatched for transformation"
        );

        // The barrier owns the run from here, even for an empty snapshot
        // (the verifier rejects a version that announced no tables).
        ctx.publisher.publish(
            &msg.dataset,
            queues::CHECK_DONE,
            &CheckDone {
                version: snapshot.version.clone(),
                attempt: 0,
            },
        )?;

        Ok(())
    }
}
