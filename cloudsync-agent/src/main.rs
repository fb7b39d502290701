//! Cloudsync Agent - Main entry point
//!
//! Mirrors the configured directories into the configured object store.

use anyhow::{Context, Result};
use clap::Parser;
use cloudsync_agent::daemon::ShutdownCoordinator;
use cloudsync_agent::engine::ReconciliationEngine;
use cloudsync_agent::executor::TaskExecutor;
use cloudsync_agent::model::Backup;
use cloudsync_agent::queue::TaskQueue;
use cloudsync_agent::store::{reconcile_backups, MetadataStore, SqliteStore};
use cloudsync_agent::{cloud, config::Config, utils};
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "cloudsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run the startup sweeps, wait for their tasks, then exit without watching
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.apply_env_overrides();

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.compact)?;

    tracing::info!(
        "Starting cloudsync-agent v{} ({} backups)",
        env!("CARGO_PKG_VERSION"),
        config.backups.len()
    );

    let store = SqliteStore::open(&config.store.db_path, config.store.pool_size)
        .with_context(|| format!("failed to open {}", config.store.db_path.display()))?;
    tracing::info!("Metadata store: {}", config.store.db_path.display());

    let backups = reconcile_backups(&store, &config.backups).await?;
    let objects = cloud::from_config(&config.provider)?;
    tracing::info!("Object store provider: {}", objects.provider());

    let queue = TaskQueue::new();
    let executor = TaskExecutor::spawn(Arc::clone(&queue), Arc::clone(&objects), &config.engine);
    let metadata: Arc<dyn MetadataStore> = Arc::new(store.clone());
    let engine = ReconciliationEngine::new(metadata, objects, Arc::clone(&queue), config.engine.clone());

    let coordinator = ShutdownCoordinator::new(config.engine.shutdown_grace());

    if args.once {
        tokio::select! {
            _ = sweep_once(&engine, backups) => {
                tracing::info!("Startup sweeps finished");
            }
            _ = coordinator.wait_for_signal() => {}
        }
    } else {
        for backup in backups {
            engine.spawn_backup(backup, true);
        }
        coordinator.wait_for_signal().await;
    }

    coordinator.shutdown(&engine, executor).await;
    store.close();

    let stats = queue.stats();
    tracing::info!("Task statistics: {}", serde_json::to_string(&stats)?);
    if stats.failed > 0 {
        tracing::warn!("{} tasks failed and will be retried by the next sweep", stats.failed);
    }

    Ok(())
}

/// Start every backup without watching and wait for all startup sweeps
async fn sweep_once(engine: &Arc<ReconciliationEngine>, backups: Vec<Backup>) {
    let sweeps = backups.into_iter().map(|backup| {
        let name = backup.name.clone();
        async move {
            match engine.start_backup(backup, false).await {
                Ok((_, report)) => tracing::info!(
                    backup = %name,
                    report = %serde_json::to_string(&report).unwrap_or_default(),
                    "Startup sweep complete"
                ),
                Err(e) => tracing::error!(backup = %name, error = %e, "Backup could not be started"),
            }
        }
    });
    join_all(sweeps).await;
}
