//! Autobackup daemon - main entry point.

use anyhow::{Context, Result};
use autobackup::daemon::shutdown::ShutdownCoordinator;
use autobackup::rpc::{RpcClient, StorageApi};
use autobackup::sync::SyncOrchestrator;
use autobackup::{api, reconciler::Reconciler, utils, Config};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/autobackup/config.toml")]
    config: PathBuf,

    /// Health endpoint port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file, print a summary, and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.check_config {
        return check_config(&args.config);
    }

    // The initial configuration must load; reloads later on are allowed to
    // fail and fall back to this one.
    let config = Config::from_file(&args.config)
        .with_context(|| format!("cannot read initial configuration {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;
    api::health::init_start_time();

    tracing::info!(
        "Starting autobackupd v{} ({} datasets configured)",
        env!("CARGO_PKG_VERSION"),
        config.datasets.len()
    );
    tracing::info!(
        api_url = %config.api.url,
        backup_interval = config.server.backup_interval,
        tick_interval = config.server.tick_interval,
        remote_sync = config.remote_sync.enabled,
        "Configuration loaded"
    );

    let client = RpcClient::new(&config.api.url, Duration::from_secs(config.api.timeout))?;
    let storage: Arc<dyn StorageApi> = Arc::new(client);

    // Startup probe: a storage API that never answers is the one condition
    // worth dying for. Once running, outages only flip the health endpoint.
    let mut reachable = false;
    for attempt in 1..=3u32 {
        if storage.health_check().await {
            reachable = true;
            break;
        }
        tracing::warn!(attempt, url = %config.api.url, "Storage API not reachable, retrying");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    if !reachable {
        anyhow::bail!("storage API at {} unreachable during startup", config.api.url);
    }

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();

    // Health surface
    let health = Arc::new(api::HealthState::new(config.health.failure_threshold));
    let port = args.port.unwrap_or(config.health.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint: http://{}/health", addr);

    let app = api::create_router(health.clone());
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    // Reconciliation loop
    let orchestrator = SyncOrchestrator::new(
        storage.clone(),
        Duration::from_secs(config.remote_sync.poll_interval),
        cancel.clone(),
    );
    let reconciler = Reconciler::new(storage, config, args.config.clone(), orchestrator, health);
    let reconciler_handle = tokio::spawn(reconciler.run(cancel.clone()));

    shutdown.wait_for_signal().await;
    tracing::info!("Shutting down...");

    if tokio::time::timeout(Duration::from_secs(5), reconciler_handle)
        .await
        .is_err()
    {
        tracing::warn!("Reconciler shutdown timeout");
    }
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Health server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Health server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Health server task panicked: {}", e),
        Err(_) => tracing::warn!("Health server shutdown timeout"),
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

/// `--check-config`: validate and summarize the file, nonzero exit on error.
fn check_config(path: &PathBuf) -> Result<()> {
    println!("Testing config file: {}", path.display());
    let config = Config::from_file(path).context("configuration is invalid")?;
    print!("{}", config.summary());
    println!("Configuration OK");
    Ok(())
}
