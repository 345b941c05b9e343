//! stalesync - serve location-keyed API data from a local SQLite store
//!
//! Runs one TTL-gated sync cycle and prints the resulting dataset as JSON, or
//! with `--watch` keeps syncing on the configured interval until Ctrl-C.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stalesync::cache::SqliteStore;
use stalesync::cli::Cli;
use stalesync::config::SyncConfig;
use stalesync::data::{HttpFetcher, RecordsConverter};
use stalesync::refresh::{RefreshConfig, RefreshHandle, SyncMessage};
use stalesync::sync::SyncCoordinator;

fn init_tracing() {
    // RUST_LOG controls the level (e.g. RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => SyncConfig::default_path()?,
    };
    let config = SyncConfig::load(&config_path)?;
    info!(path = %config_path.display(), "Loaded config");

    let mut ctx = config.location_context()?;
    for rejected in cli.apply_overrides(&mut ctx) {
        warn!(error = %rejected, "Ignoring location override");
    }

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config.database_path()?,
    };
    let store = SqliteStore::open(&db_path, config.storage.auto_provision)?;
    let fetcher = HttpFetcher::new(Duration::from_secs(config.source.timeout_secs))?;
    let mut coordinator = SyncCoordinator::from_config(
        &config,
        Box::new(RecordsConverter),
        Box::new(fetcher),
        store,
    )?;

    if !cli.watch {
        let synced = coordinator.check_and_update(&ctx).await?;
        info!(status = %synced.status, rows = synced.dataset.row_count(), "Sync complete");
        println!("{}", serde_json::to_string_pretty(&synced.dataset)?);
        return Ok(());
    }

    let refresh = RefreshConfig {
        interval: Duration::from_secs(config.schedule.interval_secs),
    };
    info!(
        location = %ctx.location(),
        interval_secs = config.schedule.interval_secs,
        "Watching; press Ctrl-C to stop"
    );
    let mut handle = RefreshHandle::spawn(coordinator, ctx, refresh);

    loop {
        tokio::select! {
            message = handle.receiver.recv() => match message {
                Some(SyncMessage::CycleStarted) => debug!("Cycle started"),
                Some(SyncMessage::CycleCompleted(synced)) => {
                    debug!(status = %synced.status, "Cycle finished");
                }
                Some(SyncMessage::CycleFailed(e)) => debug!(error = %e, "Cycle finished with error"),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Stopping");
                break;
            }
        }
    }

    if handle.shutdown().await.is_none() {
        return Err("sync task stopped abnormally".into());
    }
    Ok(())
}
