//! markup-sync service.
//!
//! Runs the debounced job queue, a single worker that hands each job to the
//! configured scraper command, periodic retention and the HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use markup_log::{debug, info, warn};
use markup_queue::{MemoryStore, Queue, Worker};
use markup_server::{AppState, CommandHandler, Housekeeper, ServiceConfig};
use std::path::PathBuf;

/// Debounced page-sync job queue
#[derive(Parser)]
#[command(name = "markup-sync")]
#[command(version)]
#[command(about = "Debounced page-sync job queue with an HTTP API")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MARKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServiceConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
        config.validate().context("invalid --bind")?;
    }

    markup_log::init();
    if let Some(log) = markup_log::installed_config() {
        debug!(level = ?log.level, format = ?log.format, "Logging initialised");
    }

    let command = config.handler_command()?.to_string();
    let addr = config.bind_addr()?;
    let queue = open_queue(&config).await?;

    let handler = CommandHandler::new(command).with_timeout(config.handler_timeout());
    let mut worker = Worker::with_config(queue.clone(), handler, config.worker_config());
    worker.start().await.context("failed to start worker")?;

    let mut housekeeper = Housekeeper::new(queue.clone(), config.housekeeping_interval());
    housekeeper.start();

    let served = markup_server::serve(addr, AppState::new(queue), shutdown_signal()).await;

    info!("Shutting down");
    housekeeper.stop().await;
    worker.stop().await?;
    served?;
    Ok(())
}

async fn open_queue(config: &ServiceConfig) -> Result<Queue> {
    let queue_config = config.queue_config();
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            use markup_queue::{RedisStore, RedisStoreConfig};

            let store = RedisStore::connect(RedisStoreConfig::new(
                url.clone(),
                config.queue_name.clone(),
            ))
            .await
            .context("failed to connect to Redis")?;
            info!(queue = %config.queue_name, "Using Redis job store");
            Ok(Queue::with_config(store, queue_config))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("MARKUP_REDIS_URL is set but Redis support is not compiled in"),
        None => {
            warn!("No Redis URL configured; jobs are kept in memory and lost on restart");
            Ok(Queue::with_config(MemoryStore::new(), queue_config))
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
