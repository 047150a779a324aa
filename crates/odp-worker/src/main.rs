//! ODP Worker - runs the dataset import pipeline
//!
//! One process hosts every stage consumer plus either the periodic
//! scheduler (`run`) or a one-shot import (`import`).

mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use odp_broker::{Dispatcher, TopicExchange};
use odp_common::logging::{init_logging, LogConfig, LogLevel};
use odp_pipeline::source::FeedSource;
use odp_pipeline::store::{
    postgres, Catalog, MemoryCatalog, MemoryTableStore, PgCatalog, PgTableStore, TableStore,
};
use odp_pipeline::{register_stages, PipelineConfig, StageContext};

#[derive(Parser, Debug)]
#[command(name = "odp-worker")]
#[command(author, version, about = "Open data pipeline worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Storage backend for catalog and tables
    #[arg(long, value_enum, default_value_t = StoreBackend::Postgres)]
    store: StoreBackend,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreBackend {
    /// Postgres, connected via DATABASE_URL
    Postgres,
    /// In-memory, for dry runs; nothing survives the process
    Memory,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stage consumers and poll the upstream feed on a schedule
    Run {
        /// Seconds between upstream freshness checks
        #[arg(long, default_value_t = 3_600)]
        interval_secs: u64,
    },

    /// Import the current upstream snapshot once and wait for the outcome
    Import {
        /// Seconds to wait for the run to settle
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_level(log_level)
        .with_file_prefix("odp-worker");
    init_logging(&log_config)?;

    let config = PipelineConfig::from_env()?;
    let (catalog, tables) = build_stores(cli.store).await?;

    let exchange = Arc::new(TopicExchange::new("odp"));
    let mut dispatcher = Dispatcher::new(Arc::clone(&exchange), config.queue_prefix.clone());
    let ctx = Arc::new(StageContext {
        catalog,
        tables,
        source: Arc::new(FeedSource::new(&config)),
        publisher: dispatcher.publisher(),
        config,
    });

    register_stages(&mut dispatcher, Arc::clone(&ctx))
        .context("failed to register stage queues")?;
    let consumers = dispatcher.start()?;
    info!(consumers = consumers.len(), "stage consumers started");

    match cli.command {
        Command::Run { interval_secs } => {
            scheduler::run(ctx, Duration::from_secs(interval_secs)).await
        }
        Command::Import { timeout_secs } => {
            scheduler::import_once(ctx, Duration::from_secs(timeout_secs)).await
        }
    }
}

async fn build_stores(
    backend: StoreBackend,
) -> Result<(Arc<dyn Catalog>, Arc<dyn TableStore>)> {
    match backend {
        StoreBackend::Postgres => {
            let url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set for the postgres backend")?;
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .context("failed to connect to postgres")?;
            postgres::ensure_schema(&pool).await?;
            info!("connected to postgres");
            Ok((
                Arc::new(PgCatalog::new(pool.clone())),
                Arc::new(PgTableStore::new(pool)),
            ))
        }
        StoreBackend::Memory => {
            info!("using in-memory stores, nothing will be persisted");
            Ok((Arc::new(MemoryCatalog::new()), Arc::new(MemoryTableStore::new())))
        }
    }
}
