//! Dredge backend - main entry point.
//!
//! Wires the queue, registry and worker manager together and runs the
//! dispatch loop until a termination signal arrives. Signal handling lives
//! here as a separate subscription; the manager's abort and stop logic is
//! plain, independently testable code.

use clap::Parser;
use std::sync::Arc;

use dredge_core::{
    config::Config,
    db::Database,
    jobs::{register_builtin, JobQueue, WorkerManager, WorkerRegistry},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "dredge-backend", about = "Dredge backend daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "DREDGE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration
    let config = Config::load_from(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Warning: could not load config: {}. Using defaults.", e);
        Config::default()
    });
    let config = Arc::new(config);

    // Initialize logging and metrics
    telemetry::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Dredge backend"
    );

    // Connect to the database and bring up the persistent queue
    let database = Database::connect(
        &config.database.url,
        "dredge-backend",
        config.database.max_connections,
    )
    .await?;
    let queue = JobQueue::postgres(&database).await?;
    tracing::info!("Connected to database");

    // Build the worker catalog
    let mut registry = WorkerRegistry::new();
    register_builtin(&mut registry);

    // Start the manager
    let manager = WorkerManager::new(queue, Some(database), Arc::new(registry), config);

    tokio::spawn(handle_signals(manager.clone()));

    manager.run().await;
    tracing::info!("Backend shutdown complete");

    Ok(())
}

/// Map process signals onto manager lifecycle calls.
///
/// SIGTERM triggers the full abort sequence (drain blocking-call
/// cancellations, then stop dispatch); Ctrl+C is a soft stop.
async fn handle_signals(manager: Arc<WorkerManager>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received interrupt, stopping dispatch");
            manager.stop();
        }
        _ = terminate => {
            manager.abort().await;
        }
    }
}
