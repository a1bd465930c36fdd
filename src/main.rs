use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use futures::future::join_all;
use newsletter_dispatch::config;
use newsletter_dispatch::db;
use newsletter_dispatch::delivery::{LogTransport, ManifestRenderer, SqliteUserDirectory, UserDirectory};
use newsletter_dispatch::generation::generate_send_requests_for_day;
use newsletter_dispatch::payload::FsPayloadStore;
use newsletter_dispatch::processor::SendRequestProcessor;
use newsletter_dispatch::sweeper::sweep_expired_requests;
use newsletter_dispatch::worker::{self, WorkerContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Newsletter scheduling and delivery daemon")]
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

    let processor = Arc::new(SendRequestProcessor::new(pool.clone(), cfg.processor_settings()).await?);
    let directory: Arc<dyn UserDirectory> = Arc::new(SqliteUserDirectory::new(pool.clone()));
    let store = Arc::new(FsPayloadStore::in_data_dir(&cfg.app.data_dir));
    let ctx = WorkerContext {
        pool: pool.clone(),
        processor: processor.clone(),
        directory: directory.clone(),
        renderer: Arc::new(ManifestRenderer),
        transport: Arc::new(LogTransport),
        store: store.clone(),
        environment: cfg.app.environment.clone(),
        defaults: cfg.schedule_defaults(),
    };
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Generation: today and tomorrow, so preloads can start a day ahead.
    {
        let pool = pool.clone();
        let processor = processor.clone();
        let directory = directory.clone();
        let languages = cfg.languages();
        let defaults = cfg.schedule_defaults();
        let every = Duration::from_secs(cfg.scheduler.generation_interval_seconds);
        handles.push(tokio::spawn(async move {
            loop {
                let now = Utc::now();
                for day in [now, now + ChronoDuration::days(1)] {
                    if let Err(err) =
                        generate_send_requests_for_day(&pool, directory.as_ref(), &languages, day, &defaults).await
                    {
                        error!(?err, "generation pass failed");
                    }
                }
                if let Err(err) = processor.force_resync().await {
                    error!(?err, "processor resync failed");
                }
                tokio::time::sleep(every).await;
            }
        }));
    }

    for n in 0..cfg.workers.preload {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match worker::process_next_preload(&ctx).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll_sleep).await,
                    Err(err) => {
                        error!(worker = n, ?err, "preload worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    for n in 0..cfg.workers.fulfill {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match worker::process_next_fulfill(&ctx).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll_sleep).await,
                    Err(err) => {
                        error!(worker = n, ?err, "fulfill worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    {
        let pool = pool.clone();
        let environment = cfg.app.environment.clone();
        let retention = cfg.retention_period();
        let every = Duration::from_secs(cfg.scheduler.sweep_interval_seconds);
        handles.push(tokio::spawn(async move {
            loop {
                let older_than = Utc::now() - retention;
                if let Err(err) = sweep_expired_requests(&pool, store.as_ref(), &environment, older_than).await {
                    error!(?err, "retention sweep failed");
                }
                tokio::time::sleep(every).await;
            }
        }));
    }

    info!(
        preload_workers = cfg.workers.preload,
        fulfill_workers = cfg.workers.fulfill,
        environment = %cfg.app.environment,
        "newsletter dispatch running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        _ = join_all(handles.iter_mut()) => {
            error!("all worker tasks exited");
        }
    }
    for handle in &handles {
        handle.abort();
    }
    pool.close().await;
    Ok(())
}
