use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clinic_import::cleanup::CleanupSweeper;
use clinic_import::clinic::SqliteClinic;
use clinic_import::config;
use clinic_import::db;
use clinic_import::processor::ImportProcessor;
use clinic_import::queue::{self, RetryPolicy};

#[derive(Debug, Parser)]
#[command(author, version, about = "Background worker for bulk CSV imports")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let recovered = db::requeue_running_tasks(&pool).await?;
    if recovered > 0 {
        warn!(recovered, "requeued tasks left running by a previous process");
    }

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();

    let clinic = Arc::new(SqliteClinic::new(pool.clone()));
    let processor = ImportProcessor::new(pool.clone(), clinic, cfg.import.batch_size)
        .with_abort(abort.clone());
    let workers = queue::spawn_workers(
        pool.clone(),
        Arc::new(processor),
        RetryPolicy::new(cfg.retry_delays()),
        cfg.queue.workers,
        Duration::from_millis(cfg.queue.poll_interval_ms),
        shutdown.clone(),
    );

    let sweeper = CleanupSweeper::new(
        pool.clone(),
        &cfg.import.upload_dir,
        chrono::Duration::days(cfg.cleanup.upload_max_age_days),
        chrono::Duration::days(cfg.cleanup.status_retention_days),
    );
    let cleanup = sweeper.spawn_scheduled(cfg.cleanup_interval(), shutdown.clone());

    info!(workers = cfg.queue.workers, "import daemon started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for in-flight imports");
    shutdown.cancel();

    let grace = Duration::from_secs(cfg.queue.shutdown_grace_seconds);
    let mut drain = Box::pin(futures::future::join_all(workers));
    if tokio::time::timeout(grace, &mut drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "imports still running after grace period; aborting");
        abort.cancel();
        drain.await;
    }
    let _ = cleanup.await;

    pool.close().await;
    info!("import daemon stopped");
    Ok(())
}
