use anyhow::Result;
use chrono::{Duration, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use newsletter_dispatch::config;
use newsletter_dispatch::db;
use newsletter_dispatch::payload::FsPayloadStore;
use newsletter_dispatch::sweeper::sweep_expired_requests;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Retire send requests past the retention period and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override `scheduler.retention_days`
    #[arg(long)]
    older_than_days: Option<u64>,
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

    let retention = match args.older_than_days {
        Some(days) => Duration::days(days as i64),
        None => cfg.retention_period(),
    };
    let older_than = Utc::now() - retention;
    let store = FsPayloadStore::in_data_dir(&cfg.app.data_dir);

    info!(%older_than, "starting retention sweep");
    let report = sweep_expired_requests(&pool, &store, &cfg.app.environment, older_than).await?;
    if report.failed > 0 {
        warn!(failed = report.failed, "some send requests could not be retired");
    }
    println!(
        "examined={} deleted={} stuck={} failed={}",
        report.examined, report.deleted, report.stuck, report.failed
    );
    pool.close().await;
    Ok(())
}
