use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use common::{logging, Config};
use master_db::{MasterDb, WorkerId};
use spooler::{Processor, Worker};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Batch worker that drains master work items from the shared store and
/// spools their detail rows into pipe-delimited output files.
#[derive(Parser, Debug)]
#[command(name = "spoold")]
struct Args {
    /// Path to the TOML config file. Example config:
    ///
    /// ```toml
    /// database_url = "postgres://localhost/spool"
    /// batch_size = 1000
    /// lock_timeout_seconds = 300
    /// poll_interval_seconds = 5
    /// max_concurrent_masters = 10
    /// output_directory = "./output"
    ///
    /// [business_center_priorities]
    /// NYC = 100
    /// LON = 50
    /// ```
    ///
    /// Values can be overridden with `SPOOL_CONFIG_`-prefixed env vars.
    #[arg(long, short, env = "SPOOL_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    logging::register_logger();

    let args = Args::parse();
    let config = Config::load(&args.config, true).map_err(|err| anyhow::anyhow!(err))?;
    let config = Arc::new(config);

    // Priorities are applied externally when masters are seeded; the stored
    // row priority is what claim ordering trusts. Logged here for operators.
    for (business_center, priority) in &config.business_center_priorities {
        tracing::debug!(%business_center, priority, "configured business center priority");
    }

    let db = MasterDb::connect(&config.database_url, config.pool_size)
        .await
        .context("failed to connect to the master db")?;

    let worker_id = WorkerId::generate();
    info!(worker = %worker_id, output_directory = %config.output_directory.display(), "starting spooler");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let processor = Processor::new(db, config.clone(), worker_id);
    Worker::new(processor, config, shutdown).run().await;

    info!("shutdown complete");
    Ok(())
}

/// Trigger the shutdown token on SIGTERM or SIGINT. Active cycles observe it
/// at their next suspension point and abort; the worker loop stops claiming
/// new masters immediately.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), anyhow::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal received"),
            _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal received"),
        }
        shutdown.cancel();
    });

    Ok(())
}
