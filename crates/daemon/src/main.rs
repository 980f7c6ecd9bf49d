//! Eventjobs daemon - main entry point

mod settings;
mod telemetry;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use eventjobs_api_rpc::{RpcServer, RpcServerConfig, DEFAULT_RPC_PORT};
use eventjobs_core::application::{shutdown_channel, CleanupScheduler, JobConsumerManager, JobManager};
use eventjobs_core::port::SystemTimeProvider;
use eventjobs_infra_sqlite::{create_pool, run_migrations, SqliteResourceStore};
use eventjobs_infra_system::CommandConsumer;

use crate::settings::DaemonConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging first so configuration errors are reported
    let _log_guard = telemetry::init_logging()?;
    info!("Eventjobs v{} starting...", VERSION);

    // 2. Load configuration (file, then environment)
    let config_path = std::env::var("EVENTJOBS_CONFIG").ok();
    let config = DaemonConfig::load(config_path.as_deref())?;

    let db_path = std::env::var("EVENTJOBS_DB_PATH")
        .map(|p| shellexpand::tilde(&p).into_owned())
        .unwrap_or_else(|_| config.db_path());

    let rpc_port: u16 = std::env::var("EVENTJOBS_RPC_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(config.rpc_port)
        .unwrap_or(DEFAULT_RPC_PORT);

    // 3. Initialize database
    info!(db_path = %db_path, "Initializing database...");
    if let Some(parent) = Path::new(&db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let pool = create_pool(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    // 4. Consumers
    let consumers = Arc::new(JobConsumerManager::new(
        &config.engine.consumer_whitelist,
        &config.engine.consumer_blacklist,
    ));
    for spec in &config.commands {
        let topics: Vec<&str> = spec.topics.iter().map(String::as_str).collect();
        let consumer = Arc::new(CommandConsumer::new(spec.clone()));
        let service_id = consumers.bind(&topics, spec.ranking, consumer);
        info!(
            service_id,
            program = %spec.program,
            topics = ?spec.topics,
            "Command consumer bound"
        );
    }
    if config.commands.is_empty() {
        warn!("No command consumers configured; jobs will only be stored and distributed");
    }

    // 5. Job manager (DI wiring)
    let store = Arc::new(SqliteResourceStore::new(pool.clone()));
    let manager = JobManager::new(&config.engine, store, consumers, Arc::new(SystemTimeProvider))
        .map_err(|e| anyhow::anyhow!("Job manager setup failed: {}", e))?;
    manager.spawn_standalone_topology();

    // 6. Cleanup scheduler
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let scheduler = CleanupScheduler::new(manager.clone());
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    // 7. Start JSON-RPC server
    info!("Starting JSON-RPC server...");
    let rpc_config = RpcServerConfig {
        port: rpc_port,
        ..Default::default()
    };
    let rpc_handle = RpcServer::new(rpc_config, manager.clone())
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;

    info!(instance_id = %manager.instance_id(), "System ready. Waiting for jobs...");
    info!("Press Ctrl+C to shutdown");

    // 8. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 9. Graceful shutdown
    shutdown_tx.shutdown();
    manager.shutdown();
    rpc_handle
        .stop()
        .map_err(|e| anyhow::anyhow!("RPC server stop failed: {}", e))?;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler_handle).await.is_err() {
        warn!("Cleanup scheduler did not stop in time");
    }
    pool.close().await;

    info!("Shutdown complete.");
    Ok(())
}
