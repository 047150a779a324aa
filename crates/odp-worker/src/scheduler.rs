//! Upstream polling and one-shot imports
//!
//! The scheduler only decides *whether* to kick off an import; all the
//! actual work happens in the stage consumers. Both entry points go
//! through the same `download_files` queue the stages use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, error, info};

use odp_common::DatasetVersion;
use odp_pipeline::messages::{queues, DownloadFiles};
use odp_pipeline::store::ImportOutcome;
use odp_pipeline::StageContext;

const OUTCOME_POLL: Duration = Duration::from_millis(500);

/// Poll the upstream feed forever, dispatching an import when it changes
pub async fn run(ctx: Arc<StageContext>, interval: Duration) -> Result<()> {
    info!(
        dataset = ctx.source.dataset(),
        interval_secs = interval.as_secs(),
        "scheduler started"
    );

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        // A failed probe is retried on the next tick; the scheduler
        // itself never dies over a flaky upstream.
        if let Err(e) = check_and_dispatch(&ctx).await {
            error!(error = %e, "upstream check failed");
        }
    }
}

async fn check_and_dispatch(ctx: &StageContext) -> Result<()> {
    let dataset = ctx.source.dataset();
    let remote = ctx.source.fetch_last_modified().await?;
    let latest = ctx.catalog.latest_last_modified(dataset).await?;

    if let (Some(remote), Some(latest)) = (remote, latest) {
        if remote <= latest {
            debug!(dataset, %remote, %latest, "upstream unchanged");
            return Ok(());
        }
    }

    info!(dataset, "upstream snapshot changed, dispatching import");
    ctx.publisher.publish(
        dataset,
        queues::DOWNLOAD_FILES,
        &DownloadFiles {
            dataset: dataset.to_string(),
        },
    )?;
    Ok(())
}

/// Import the current snapshot once and block until the run settles
pub async fn import_once(ctx: Arc<StageContext>, timeout: Duration) -> Result<()> {
    let dataset = ctx.source.dataset();

    // The archive's MDTM stamp names the version, which is how we find
    // the run's outcome afterwards.
    let Some(last_modified) = ctx.source.fetch_last_modified().await? else {
        bail!("upstream server does not support MDTM; use 'run' instead");
    };
    let version = DatasetVersion::new(dataset, last_modified);

    match ctx.catalog.outcome(&version).await? {
        Some(ImportOutcome::Promoted) => return report(&version, ImportOutcome::Promoted),
        Some(ImportOutcome::Rejected(reason)) => {
            // A rejected run is retriable; clear it here so the outcome
            // poll below cannot pick up the stale marker.
            info!(%version, %reason, "previous run was rejected, retrying");
            ctx.catalog.clear_version(&version).await?;
        }
        None => {}
    }

    info!(%version, "starting one-shot import");
    ctx.publisher.publish(
        dataset,
        queues::DOWNLOAD_FILES,
        &DownloadFiles {
            dataset: dataset.to_string(),
        },
    )?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(outcome) = ctx.catalog.outcome(&version).await? {
            return report(&version, outcome);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("import of {version} did not settle within {}s", timeout.as_secs());
        }
        tokio::time::sleep(OUTCOME_POLL).await;
    }
}

fn report(version: &DatasetVersion, outcome: ImportOutcome) -> Result<()> {
    match outcome {
        ImportOutcome::Promoted => {
            info!(%version, "import promoted");
            Ok(())
        }
        ImportOutcome::Rejected(reason) => {
            bail!("import of {version} was rejected: {reason}")
        }
    }
}
