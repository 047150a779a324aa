//! Stage handlers and queue wiring
//!
//! One handler per stage queue. Handlers are pure consumers of message
//! payloads plus the shared catalog/table-store handles; none of them
//! keeps per-version state in memory, so any consumer instance can pick
//! up any delivery.

pub mod barrier;
pub mod download;
pub mod load;
pub mod transform;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use odp_broker::{Dispatcher, Envelope, Publisher, QueueHandler, QueueOptions};

use crate::config::PipelineConfig;
use crate::messages::queues;
use crate::source::FeedSource;
use crate::store::{Catalog, TableStore};
use crate::verify::Verifier;

pub use barrier::BarrierHandler;
pub use download::DownloadHandler;
pub use load::LoadHandler;
pub use transform::TransformHandler;

/// Shared handles every stage works against
pub struct StageContext {
    pub catalog: Arc<dyn Catalog>,
    pub tables: Arc<dyn TableStore>,
    pub source: Arc<FeedSource>,
    pub publisher: Publisher,
    pub config: PipelineConfig,
}

impl StageContext {
    pub fn verifier(&self) -> Verifier {
        Verifier::new(Arc::clone(&self.catalog), Arc::clone(&self.tables))
    }
}

/// Logs dead-lettered messages so a stuck run is visible in the logs
struct DeadLetterSink;

#[async_trait]
impl QueueHandler for DeadLetterSink {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        warn!(
            message_id = %envelope.id,
            routing_key = %envelope.routing_key,
            bytes = envelope.payload.len(),
            "message dead-lettered"
        );
        Ok(())
    }
}

/// Declare every stage queue and attach its handler
pub fn register_stages(
    dispatcher: &mut Dispatcher,
    ctx: Arc<StageContext>,
) -> odp_broker::Result<()> {
    let publisher = &ctx.publisher;
    let dead_letter = |queue: &str| Some(publisher.dead_letter_key(queue));

    dispatcher.register_queue(
        queues::DOWNLOAD_FILES,
        Arc::new(DownloadHandler::new(Arc::clone(&ctx))),
        QueueOptions {
            dead_letter_routing_key: dead_letter(queues::DOWNLOAD_FILES),
            ..Default::default()
        },
    )?;

    dispatcher.register_queue(
        queues::TRANSFORM_DATA,
        Arc::new(TransformHandler::new(Arc::clone(&ctx))),
        QueueOptions {
            dead_letter_routing_key: dead_letter(queues::TRANSFORM_DATA),
            consumers: ctx.config.transform_consumers,
            ..Default::default()
        },
    )?;

    // Chunk messages carry the TTL: a chunk stuck behind a dead loader
    // expires into the dead-letter queue instead of blocking forever.
    dispatcher.register_queue(
        queues::SAVE_DATA,
        Arc::new(LoadHandler::new(Arc::clone(&ctx))),
        QueueOptions {
            dead_letter_routing_key: dead_letter(queues::SAVE_DATA),
            message_ttl: ctx.config.message_ttl(),
            consumers: ctx.config.load_consumers,
            ..Default::default()
        },
    )?;

    dispatcher.register_queue(
        queues::CHECK_DONE,
        Arc::new(BarrierHandler::new(Arc::clone(&ctx))),
        QueueOptions {
            dead_letter_routing_key: dead_letter(queues::CHECK_DONE),
            ..Default::default()
        },
    )?;

    let dead_binding = format!("dead.{}.#", publisher.prefix());
    dispatcher.register_queue_with_binding(
        queues::DEAD_LETTER,
        &dead_binding,
        Arc::new(DeadLetterSink),
        QueueOptions::default(),
    )?;

    Ok(())
}
