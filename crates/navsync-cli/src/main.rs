use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use navsync_storage::{FeedSnapshot, PgStore};
use navsync_sync::{build_scheduler, IngestionPipeline, SyncConfig};
use navsync_web::{AppState, WebConfig};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "navsync")]
#[command(about = "AMFI NAV feed ingestion and query API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion and print its report.
    Sync {
        /// Ingest a local NAVAll.txt instead of fetching the feed.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Parse a local feed file and print counters; touches no store.
    Parse { path: PathBuf },
    Migrate,
    /// Serve the query API, plus the cron job when the scheduler is enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "navsync=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { file: None }) {
        Commands::Sync { file } => sync(&config, file).await?,
        Commands::Parse { path } => parse(&config, path).await?,
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => serve(&config).await?,
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

async fn read_feed(path: &Path) -> Result<FeedSnapshot> {
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(FeedSnapshot::new(body, Utc::now()))
}

async fn sync(config: &SyncConfig, file: Option<PathBuf>) -> Result<()> {
    let store = Arc::new(connect(config).await?);
    let report = match file {
        Some(path) => {
            let snapshot = read_feed(&path).await?;
            let pipeline =
                IngestionPipeline::new(store, config.feed_parser()?, config.upsert_config());
            pipeline.ingest(&snapshot).await?
        }
        None => {
            let job = config.build_job(store, Arc::new(config.feed_source()?))?;
            job.run().await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn parse(config: &SyncConfig, path: PathBuf) -> Result<()> {
    let snapshot = read_feed(&path).await?;
    let parsed = config.feed_parser()?.parse(&snapshot.body);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "file": path.display().to_string(),
            "digest": snapshot.digest,
            "stats": parsed.stats,
            "headers": parsed.headers,
        }))?
    );
    Ok(())
}

async fn serve(config: &SyncConfig) -> Result<()> {
    let store = Arc::new(connect(config).await?);
    let job = Arc::new(config.build_job(store.clone(), Arc::new(config.feed_source()?))?);

    let mut scheduler = if config.scheduler_enabled {
        let sched = build_scheduler(job.clone(), &config.sync_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "ingestion scheduler started");
        Some(sched)
    } else {
        None
    };

    let web = WebConfig::from_env();
    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    let state = AppState::new(store, job.health());
    navsync_web::serve(listener, state, navsync_web::shutdown_signal()).await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
