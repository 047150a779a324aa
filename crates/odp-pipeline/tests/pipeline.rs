//! End-to-end pipeline runs over the in-memory backends
//!
//! Drives the transform/load/barrier stages through a real dispatcher
//! and checks the promotion and rejection paths of the verifier.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use odp_broker::{Dispatcher, TopicExchange};
use odp_common::{DatasetVersion, OdpError, RawFileDescriptor, TableKind};
use odp_pipeline::messages::{queues, CheckDone, SaveData, TransformData};
use odp_pipeline::source::FeedSource;
use odp_pipeline::store::{
    Catalog, ImportOutcome, MemoryCatalog, MemoryTableStore, TableStore,
};
use odp_pipeline::{register_stages, BarrierConfig, PipelineConfig, StageContext, Verifier};

struct Harness {
    exchange: Arc<TopicExchange>,
    dispatcher: Dispatcher,
    catalog: Arc<MemoryCatalog>,
    tables: Arc<MemoryTableStore>,
    ctx: Arc<StageContext>,
    _work_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(BarrierConfig {
        poll_interval_ms: 10,
        max_attempts: 200,
    })
}

fn harness_with(barrier: BarrierConfig) -> Harness {
    let work_dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        work_dir: work_dir.path().to_path_buf(),
        barrier,
        ..Default::default()
    };

    let exchange = Arc::new(TopicExchange::new("odp-test"));
    let dispatcher = Dispatcher::new(Arc::clone(&exchange), config.queue_prefix.clone());
    let catalog = Arc::new(MemoryCatalog::new());
    let tables = Arc::new(MemoryTableStore::new());

    let ctx = Arc::new(StageContext {
        catalog: catalog.clone(),
        tables: tables.clone(),
        source: Arc::new(FeedSource::new(&config)),
        publisher: dispatcher.publisher(),
        config,
    });

    Harness {
        exchange,
        dispatcher,
        catalog,
        tables,
        ctx,
        _work_dir: work_dir,
    }
}

fn version() -> DatasetVersion {
    DatasetVersion::new("gtfs", Utc.with_ymd_and_hms(2026, 3, 14, 6, 30, 0).unwrap())
}

fn write_table_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

fn stops_csv(rows: usize) -> String {
    let mut csv = String::from("stop_id,stop_name\n");
    for i in 0..rows {
        csv.push_str(&format!("s{i},Stop {i}\n"));
    }
    csv
}

fn transform_message(version: &DatasetVersion, table: TableKind, path: std::path::PathBuf) -> TransformData {
    TransformData {
        version: version.clone(),
        file: RawFileDescriptor {
            table,
            path,
            mtime: version.last_modified,
        },
    }
}

async fn wait_for_outcome(catalog: &MemoryCatalog, version: &DatasetVersion) -> ImportOutcome {
    for _ in 0..500 {
        if let Some(outcome) = catalog.outcome(version).await.unwrap() {
            return outcome;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("import run never settled");
}

#[tokio::test]
async fn test_full_run_promotes_on_exact_match() {
    let mut h = harness();
    register_stages(&mut h.dispatcher, Arc::clone(&h.ctx)).unwrap();
    let handles = h.dispatcher.start().unwrap();

    let v = version();
    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();

    // 2500 rows split into chunks of 1000: two full chunks and a remainder.
    let path = write_table_file(h._work_dir.path(), "stops.txt", &stops_csv(2_500));
    let publisher = h.ctx.publisher.clone();
    publisher
        .publish(
            "gtfs",
            queues::TRANSFORM_DATA,
            &transform_message(&v, TableKind::Stops, path),
        )
        .unwrap();
    publisher
        .publish("gtfs", queues::CHECK_DONE, &CheckDone { version: v.clone(), attempt: 0 })
        .unwrap();

    assert_eq!(wait_for_outcome(&h.catalog, &v).await, ImportOutcome::Promoted);

    let progress = h.catalog.table_progress(&v).await.unwrap();
    assert_eq!(progress[0].expected_chunks, Some(3));
    assert_eq!(progress[0].loaded_chunks, 3);

    assert_eq!(h.tables.production_count(TableKind::Stops).await.unwrap(), 2_500);
    assert_eq!(h.tables.staging_count(TableKind::Stops).await.unwrap(), 0);
    assert!(h.exchange.depth(queues::SAVE_DATA).unwrap().is_drained());

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_parse_failure_rejects_run_but_barrier_still_fires() {
    let mut h = harness();
    register_stages(&mut h.dispatcher, Arc::clone(&h.ctx)).unwrap();
    let handles = h.dispatcher.start().unwrap();

    let v = version();
    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Routes).await.unwrap();

    let stops = write_table_file(h._work_dir.path(), "stops.txt", &stops_csv(10));
    // No registry column matches, so the transform marks the table skipped.
    let routes = write_table_file(h._work_dir.path(), "routes.txt", "nothing,known\n1,2\n");

    let publisher = h.ctx.publisher.clone();
    publisher
        .publish(
            "gtfs",
            queues::TRANSFORM_DATA,
            &transform_message(&v, TableKind::Stops, stops),
        )
        .unwrap();
    publisher
        .publish(
            "gtfs",
            queues::TRANSFORM_DATA,
            &transform_message(&v, TableKind::Routes, routes),
        )
        .unwrap();
    publisher
        .publish("gtfs", queues::CHECK_DONE, &CheckDone { version: v.clone(), attempt: 0 })
        .unwrap();

    let outcome = wait_for_outcome(&h.catalog, &v).await;
    match outcome {
        ImportOutcome::Rejected(reason) => assert!(reason.contains("routes")),
        other => panic!("expected rejection, got {other:?}"),
    }

    // The healthy table must not leak into production on a rejected run.
    assert_eq!(h.tables.production_count(TableKind::Stops).await.unwrap(), 0);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_lost_chunk_rejects_and_keeps_production() {
    let h = harness();
    let v = version();

    h.tables
        .seed_production(TableKind::Stops, vec![vec!["keep".into()]]);

    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();
    h.catalog.record_row_total(&v, TableKind::Stops, 2_000).await.unwrap();
    h.catalog.record_expected_chunks(&v, TableKind::Stops, 2).await.unwrap();

    // Only one of the two chunks ever reached the loader.
    h.tables.reset_staging(TableKind::Stops).await.unwrap();
    let chunk: Vec<Vec<String>> = (0..1_000).map(|i| vec![i.to_string()]).collect();
    h.tables.insert_chunk(TableKind::Stops, &chunk).await.unwrap();
    h.catalog.add_loaded_chunks(&v, TableKind::Stops, 1).await.unwrap();

    let verifier = Verifier::new(h.catalog.clone(), h.tables.clone());
    let outcome = verifier.verify(&v).await.unwrap();
    assert!(!outcome.is_promoted());

    match h.catalog.outcome(&v).await.unwrap() {
        Some(ImportOutcome::Rejected(reason)) => {
            assert!(reason.contains("stops"));
            assert!(reason.contains("2000"));
            assert!(reason.contains("1000"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.tables.production_count(TableKind::Stops).await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_chunk_fails_closed() {
    let h = harness();
    let v = version();

    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();
    h.catalog.record_row_total(&v, TableKind::Stops, 1_000).await.unwrap();
    h.catalog.record_expected_chunks(&v, TableKind::Stops, 1).await.unwrap();

    // The same chunk delivered twice: surplus rows, counter past expected.
    h.tables.reset_staging(TableKind::Stops).await.unwrap();
    let chunk: Vec<Vec<String>> = (0..1_000).map(|i| vec![i.to_string()]).collect();
    h.tables.insert_chunk(TableKind::Stops, &chunk).await.unwrap();
    h.tables.insert_chunk(TableKind::Stops, &chunk).await.unwrap();
    h.catalog.add_loaded_chunks(&v, TableKind::Stops, 2).await.unwrap();

    let verifier = Verifier::new(h.catalog.clone(), h.tables.clone());
    let outcome = verifier.verify(&v).await.unwrap();
    assert!(!outcome.is_promoted());
    assert_eq!(h.tables.production_count(TableKind::Stops).await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_announced_set_is_rejected() {
    let h = harness();
    let v = version();
    h.catalog.record_version(&v).await.unwrap();

    let verifier = Verifier::new(h.catalog.clone(), h.tables.clone());
    let outcome = verifier.verify(&v).await.unwrap();
    assert!(!outcome.is_promoted());
    assert!(matches!(
        h.catalog.outcome(&v).await.unwrap(),
        Some(ImportOutcome::Rejected(_))
    ));
}

#[tokio::test]
async fn test_verification_is_idempotent() {
    let h = harness();
    let v = version();

    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Agency).await.unwrap();
    h.catalog.record_row_total(&v, TableKind::Agency, 2).await.unwrap();
    h.catalog.record_expected_chunks(&v, TableKind::Agency, 1).await.unwrap();

    h.tables.reset_staging(TableKind::Agency).await.unwrap();
    h.tables
        .insert_chunk(TableKind::Agency, &[vec!["a1".into()], vec!["a2".into()]])
        .await
        .unwrap();
    h.catalog.add_loaded_chunks(&v, TableKind::Agency, 1).await.unwrap();

    let verifier = Verifier::new(h.catalog.clone(), h.tables.clone());
    assert!(verifier.verify(&v).await.unwrap().is_promoted());

    // A duplicate barrier delivery settles without touching tables again.
    assert!(verifier.verify(&v).await.unwrap().is_promoted());
    assert_eq!(h.tables.production_count(TableKind::Agency).await.unwrap(), 2);
}

#[tokio::test]
async fn test_stalled_run_is_force_verified_after_attempt_cap() {
    let mut h = harness_with(BarrierConfig {
        poll_interval_ms: 10,
        max_attempts: 3,
    });
    register_stages(&mut h.dispatcher, Arc::clone(&h.ctx)).unwrap();
    let handles = h.dispatcher.start().unwrap();

    let v = version();
    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();
    h.catalog.record_row_total(&v, TableKind::Stops, 2_000).await.unwrap();
    h.catalog.record_expected_chunks(&v, TableKind::Stops, 2).await.unwrap();
    h.tables.reset_staging(TableKind::Stops).await.unwrap();

    // Only the first of two chunks ever reaches the queue; the run can
    // never drain, so the attempt cap must force verification.
    let rows: Vec<Vec<String>> = (0..1_000).map(|i| vec![i.to_string()]).collect();
    let publisher = h.ctx.publisher.clone();
    publisher
        .publish(
            "gtfs",
            queues::SAVE_DATA,
            &SaveData {
                version: v.clone(),
                table: TableKind::Stops,
                sequence: 0,
                rows,
            },
        )
        .unwrap();
    publisher
        .publish("gtfs", queues::CHECK_DONE, &CheckDone { version: v.clone(), attempt: 0 })
        .unwrap();

    match wait_for_outcome(&h.catalog, &v).await {
        ImportOutcome::Rejected(reason) => assert!(reason.contains("stops")),
        other => panic!("expected forced rejection, got {other:?}"),
    }
    assert_eq!(h.tables.production_count(TableKind::Stops).await.unwrap(), 0);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_rejected_version_stays_reimportable() {
    let h = harness();
    let promoted = DatasetVersion::new("gtfs", Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    let v = version();

    h.catalog.record_version(&promoted).await.unwrap();
    h.catalog
        .record_outcome(&promoted, &ImportOutcome::Promoted)
        .await
        .unwrap();
    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Stops).await.unwrap();
    h.catalog
        .record_outcome(&v, &ImportOutcome::Rejected("count mismatch".to_string()))
        .await
        .unwrap();

    // The rejected snapshot must not advance the freshness baseline, or
    // the connector would skip it forever.
    assert_eq!(
        h.catalog.latest_last_modified("gtfs").await.unwrap(),
        Some(promoted.last_modified)
    );

    // Clearing the version leaves a clean slate for the retry.
    h.catalog.clear_version(&v).await.unwrap();
    assert_eq!(h.catalog.outcome(&v).await.unwrap(), None);
    assert!(h.catalog.announced_tables(&v).await.unwrap().is_empty());
}

struct FlakyTableStore {
    inner: MemoryTableStore,
    failures: AtomicUsize,
}

#[async_trait::async_trait]
impl TableStore for FlakyTableStore {
    async fn reset_staging(&self, table: TableKind) -> odp_common::Result<()> {
        self.inner.reset_staging(table).await
    }

    async fn ensure_staging(&self, table: TableKind) -> odp_common::Result<()> {
        self.inner.ensure_staging(table).await
    }

    async fn insert_chunk(&self, table: TableKind, rows: &[Vec<String>]) -> odp_common::Result<u64> {
        self.inner.insert_chunk(table, rows).await
    }

    async fn staging_count(&self, table: TableKind) -> odp_common::Result<u64> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OdpError::Store("connection reset".to_string()));
        }
        self.inner.staging_count(table).await
    }

    async fn production_count(&self, table: TableKind) -> odp_common::Result<u64> {
        self.inner.production_count(table).await
    }

    async fn promote(&self, tables: &[TableKind]) -> odp_common::Result<()> {
        self.inner.promote(tables).await
    }
}

#[tokio::test]
async fn test_transient_store_error_does_not_strand_the_run() {
    let work_dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        work_dir: work_dir.path().to_path_buf(),
        barrier: BarrierConfig {
            poll_interval_ms: 10,
            max_attempts: 200,
        },
        ..Default::default()
    };

    let exchange = Arc::new(TopicExchange::new("odp-test"));
    let mut dispatcher = Dispatcher::new(Arc::clone(&exchange), config.queue_prefix.clone());
    let catalog = Arc::new(MemoryCatalog::new());
    let tables = Arc::new(FlakyTableStore {
        inner: MemoryTableStore::new(),
        failures: AtomicUsize::new(1),
    });

    let ctx = Arc::new(StageContext {
        catalog: catalog.clone(),
        tables: tables.clone(),
        source: Arc::new(FeedSource::new(&config)),
        publisher: dispatcher.publisher(),
        config,
    });
    register_stages(&mut dispatcher, Arc::clone(&ctx)).unwrap();
    let handles = dispatcher.start().unwrap();

    let v = version();
    catalog.record_version(&v).await.unwrap();
    catalog.announce_table(&v, TableKind::Agency).await.unwrap();
    catalog.record_row_total(&v, TableKind::Agency, 1).await.unwrap();
    catalog.record_expected_chunks(&v, TableKind::Agency, 1).await.unwrap();
    tables.reset_staging(TableKind::Agency).await.unwrap();
    tables
        .insert_chunk(TableKind::Agency, &[vec!["a1".into()]])
        .await
        .unwrap();
    catalog.add_loaded_chunks(&v, TableKind::Agency, 1).await.unwrap();

    // The first verification hits the store error; the barrier must
    // re-poll instead of dead-lettering, and the retry promotes.
    ctx.publisher
        .publish("gtfs", queues::CHECK_DONE, &CheckDone { version: v.clone(), attempt: 0 })
        .unwrap();

    assert_eq!(wait_for_outcome(&catalog, &v).await, ImportOutcome::Promoted);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_promotion_purges_stale_version_metadata() {
    let h = harness();
    let old = DatasetVersion::new("gtfs", Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    let v = version();

    h.catalog.record_version(&old).await.unwrap();
    h.catalog.record_version(&v).await.unwrap();
    h.catalog.announce_table(&v, TableKind::Agency).await.unwrap();
    h.catalog.record_row_total(&v, TableKind::Agency, 0).await.unwrap();
    h.catalog.record_expected_chunks(&v, TableKind::Agency, 0).await.unwrap();
    h.tables.reset_staging(TableKind::Agency).await.unwrap();

    let verifier = Verifier::new(h.catalog.clone(), h.tables.clone());
    assert!(verifier.verify(&v).await.unwrap().is_promoted());

    assert_eq!(
        h.catalog.latest_last_modified("gtfs").await.unwrap(),
        Some(v.last_modified)
    );
}
