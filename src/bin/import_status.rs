use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use clinic_import::config;
use clinic_import::db;
use clinic_import::import::ImportService;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print the status of an import job as JSON")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Job id returned when the file was queued
    job_id: String,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let service = ImportService::new(pool.clone(), cfg.import.default_kind);
    let Some(snapshot) = service.get_status(&args.job_id).await? else {
        pool.close().await;
        bail!("job {} not found", args.job_id);
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    pool.close().await;
    Ok(())
}
