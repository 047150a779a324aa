//! Completion barrier: counted drain check over the catalog
//!
//! Compares each announced table's loaded-chunk counter against the
//! expected count the transform stage recorded, instead of inspecting
//! queue depths: a queue can look empty while a chunk sits unsettled in
//! a handler, and shared queues mix versions. When every table has
//! resolved (drained or skipped), verification runs. A run that stalls
//! past the attempt cap is verified anyway, so a lost chunk surfaces as
//! a rejected run rather than an eternal poll.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use odp_broker::{Envelope, QueueHandler};

use crate::messages::{queues, CheckDone};
use crate::stages::StageContext;

pub struct BarrierHandler {
    ctx: Arc<StageContext>,
}

impl BarrierHandler {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl QueueHandler for BarrierHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let msg: CheckDone = envelope.decode()?;
        let ctx = &self.ctx;

        if let Some(outcome) = ctx.catalog.outcome(&msg.version).await? {
            info!(version = %msg.version, ?outcome, "run already settled, dropping poll");
            return Ok(());
        }

        let progress = ctx.catalog.table_progress(&msg.version).await?;
        let drained = progress.iter().all(|p| p.resolved());

        if !drained && msg.attempt < ctx.config.barrier.max_attempts {
            let pending = progress.iter().filter(|p| !p.resolved()).count();
            debug!(
                version = %msg.version,
                attempt = msg.attempt,
                pending_tables = pending,
                "import still draining, re-polling"
            );
            ctx.publisher.publish_after(
                ctx.config.barrier.poll_interval(),
                &msg.version.dataset,
                queues::CHECK_DONE,
                &CheckDone {
                    version: msg.version.clone(),
                    attempt: msg.attempt + 1,
                },
            )?;
            return Ok(());
        }

        if !drained {
            warn!(
                version = %msg.version,
                attempts = msg.attempt,
                "import stalled past the attempt cap, forcing verification"
            );
        }

        // A transient store error must not dead-letter the poll message;
        // the run would never settle. Keep polling at the same attempt.
        match ctx.verifier().verify(&msg.version).await {
            Ok(outcome) => {
                info!(version = %msg.version, ?outcome, "import run settled");
            }
            Err(e) => {
                warn!(version = %msg.version, error = %e, "verification failed, re-polling");
                ctx.publisher.publish_after(
                    ctx.config.barrier.poll_interval(),
                    &msg.version.dataset,
                    queues::CHECK_DONE,
                    &CheckDone {
                        version: msg.version.clone(),
                        attempt: msg.attempt,
                    },
                )?;
            }
        }
        Ok(())
    }
}
