use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use clinic_import::config;
use clinic_import::db;
use clinic_import::import::{stage_upload, ImportService};
use clinic_import::model::ImportKind;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum KindArg {
    Appointments,
    Unified,
}

impl From<KindArg> for ImportKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Appointments => ImportKind::Appointments,
            KindArg::Unified => ImportKind::Unified,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Stage a CSV file in the upload directory and queue it for import"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// CSV layout; defaults to `import.default_kind`
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// CSV file to import
    file: PathBuf,
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

    let staged = stage_upload(
        Path::new(&cfg.import.upload_dir),
        &args.file,
        cfg.max_upload_bytes(),
    )
    .await?;
    info!(path = %staged.display(), "upload staged");

    let service = ImportService::new(pool.clone(), cfg.import.default_kind);
    let job = match args.kind {
        Some(kind) => service.enqueue_with_kind(&staged, kind.into()).await?,
        None => service.enqueue_processing_for_file(&staged).await?,
    };
    println!("{}", serde_json::to_string_pretty(&job)?);

    pool.close().await;
    Ok(())
}
