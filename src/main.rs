//! sipp-sync - Scheduled synchronization of SIPP case and schedule records
//!
//! This is the main entry point for the sipp-sync application.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sipp_sync::config::Config;
use sipp_sync::database::SqliteDatabase;
use sipp_sync::models::{RunStatus, SyncMode};
use sipp_sync::server::{AppState, Server};
use sipp_sync::sync::{
    ReconcilerConfig, RemoteSource, RetryManager, SippClient, SyncReconciler, SyncScheduler,
};
use sipp_sync::telemetry::init_tracing;

/// sipp-sync - Scheduled synchronization of SIPP case and schedule records
#[derive(Parser, Debug)]
#[command(name = "sipp-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SIPP_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and the status API (default)
    Serve,

    /// Run one sync and print the run as JSON
    Sync {
        /// Sync mode: incremental or full
        #[arg(short, long, default_value = "incremental")]
        mode: SyncMode,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sipp-sync");

    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let client = Arc::new(SippClient::new(config.sipp.clone())?);
    info!(base_url = %config.sipp.base_url, "SIPP client initialized");

    let reconciler = Arc::new(SyncReconciler::new(
        Arc::clone(&database),
        Arc::clone(&client),
        RetryManager::new(config.retry.clone()),
        ReconcilerConfig::from_config(&config),
    ));

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, database, client, reconciler).await,
        Command::Sync { mode } => sync_once(reconciler, mode).await,
    }
}

/// Run the scheduler and HTTP server until a shutdown signal arrives
async fn serve(
    config: Config,
    database: Arc<SqliteDatabase>,
    client: Arc<SippClient>,
    reconciler: Arc<SyncReconciler<SqliteDatabase, SippClient>>,
) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scheduler = SyncScheduler::new(
        config.scheduler.clone(),
        reconciler,
        shutdown_tx.subscribe(),
    );
    let sync_handle = scheduler.manual_sync_handle();
    let scheduler_status = scheduler.status_handle();
    let scheduler_task = tokio::spawn(scheduler.run());

    let source: Arc<dyn RemoteSource> = client;
    let state = AppState {
        database,
        source,
        sync_handle: Some(sync_handle),
        scheduler_status,
    };

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = Server::new(config.server.clone(), state);

    info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting HTTP server"
    );

    let result = server
        .run(async move {
            let _ = server_shutdown.recv().await;
        })
        .await;

    // Stop the scheduler as well if the server failed on its own
    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Sync scheduler task failed");
    }

    info!("sipp-sync shutdown complete");

    result.map_err(Into::into)
}

/// Run a single reconciliation and print the run
async fn sync_once(
    reconciler: Arc<SyncReconciler<SqliteDatabase, SippClient>>,
    mode: SyncMode,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let run = reconciler.run_sync(mode, cancel).await?;

    println!("{}", serde_json::to_string_pretty(&run)?);

    match run.status {
        RunStatus::Success | RunStatus::PartialSuccess => Ok(()),
        status => Err(anyhow::anyhow!("Sync run {} finished with status {}", run.id, status)),
    }
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
    };

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
