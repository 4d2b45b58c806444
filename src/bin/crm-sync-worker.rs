//! # CRM Sync Worker
//!
//! Production entry point. `serve` runs the status interface, the queue
//! workers and the lease sweeper until Ctrl+C or SIGTERM; the other
//! subcommands are one-shot operations against the same configuration.
//!
//! ```bash
//! CRM_SYNC_ENV=production crm-sync-worker serve
//! crm-sync-worker trigger residuals --year 2024 --month 2
//! crm-sync-worker work --once
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crm_sync::config::ConfigManager;
use crm_sync::logging;
use crm_sync::models::DataType;
use crm_sync::orchestration::{
    DailySyncManager, HistoricalSyncManager, StartSyncRequest, SyncSystem,
};
use crm_sync::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "crm-sync-worker")]
#[command(about = "Synchronizes CRM merchants, volumes and residuals into PostgreSQL")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: ./config)
    #[arg(short, long, env = "CRM_SYNC_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the status interface, queue workers and lease sweeper
    Serve {
        /// Number of queue workers (overrides processor.worker_count)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Process queued jobs without the status interface
    Work {
        /// Process at most one job and exit
        #[arg(long)]
        once: bool,
    },
    /// Enqueue a sync job
    Trigger {
        /// merchants, residuals, volumes, all, historical or daily
        data_type: String,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
        /// Queue even if the same sync is already pending or running
        #[arg(long)]
        force: bool,
    },
    /// Run the historical backfill in this process
    Historical,
    /// Run the daily sync in this process
    Daily,
    /// Print the full/incremental recommendation for a data type
    Analyze {
        data_type: String,
        #[arg(long, default_value = "default")]
        scope: String,
    },
    /// Retry unresolved failed items
    Recover {
        #[arg(long)]
        sync_id: Option<Uuid>,
    },
    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_structured_logging();
    let cli = Cli::parse();

    let manager = ConfigManager::load_from_directory(cli.config_dir)
        .context("failed to load configuration")?;
    info!(
        environment = manager.environment(),
        version = env!("CARGO_PKG_VERSION"),
        "🔧 Configuration loaded"
    );

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&manager.config().sanitized())?);
        return Ok(());
    }

    let system = Arc::new(
        SyncSystem::bootstrap(manager.config().clone())
            .await
            .context("failed to bootstrap sync system")?,
    );

    match cli.command {
        Commands::Serve { workers } => serve(system, workers).await?,
        Commands::Work { once } => work(system, once).await?,
        Commands::Trigger {
            data_type,
            year,
            month,
            force,
        } => {
            let response = system
                .service()
                .start_sync(StartSyncRequest {
                    data_type,
                    year,
                    month,
                    force_sync: force,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Historical => {
            let summary = HistoricalSyncManager::new(system.context().clone())
                .run(Uuid::new_v4())
                .await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Daily => {
            let summary = DailySyncManager::new(system.context().clone())
                .run(Uuid::new_v4())
                .await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Analyze { data_type, scope } => {
            let data_type: DataType = data_type.parse()?;
            let recommendation = system
                .context()
                .analyzer
                .analyze_sync_strategy(data_type.as_str(), &scope)
                .await?;
            println!("{}", serde_json::to_string_pretty(&recommendation)?);
        }
        Commands::Recover { sync_id } => {
            let result = system.run_recovery(sync_id).await?;
            info!(
                retried = result.retried,
                recovered = result.recovered,
                unresolved = result.unresolved_count(),
                "Recovery pass finished"
            );
        }
        Commands::Config => {}
    }
    Ok(())
}

async fn work(system: Arc<SyncSystem>, once: bool) -> Result<()> {
    let processor = system.processor(worker_id(0));
    if once {
        match processor.run_once().await? {
            Some(processed) => info!(job_id = %processed.job_id, job_type = %processed.job_type, "Processed one job"),
            None => info!("Queue empty"),
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { processor.run(shutdown_rx).await });
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    handle.await??;
    Ok(())
}

async fn serve(system: Arc<SyncSystem>, workers: Option<usize>) -> Result<()> {
    let worker_count = workers.unwrap_or(system.config().processor.worker_count).max(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(worker_count + 2);

    for index in 0..worker_count {
        let processor = system.processor(worker_id(index));
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = processor.run(shutdown).await {
                error!(error = %e, "Queue worker stopped with error");
            }
        }));
    }

    let sweeper = system.sweeper();
    let shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { sweeper.run(shutdown).await }));

    if system.config().web.enabled {
        let state = Arc::new(AppState::from_system(&system));
        let bind_address = system.config().web.bind_address.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = web::serve(state, &bind_address, stop).await {
                error!(error = %e, "Status interface stopped with error");
            }
        }));
    } else {
        warn!("Status interface disabled by configuration");
    }

    info!(workers = worker_count, "🎉 CRM sync worker started; press Ctrl+C to stop");
    shutdown_signal().await;
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task panicked during shutdown");
        }
    }
    info!("👋 Shutdown complete");
    Ok(())
}

fn worker_id(index: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{host}-{}-{index}", std::process::id())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
