//! buildrd - buildr worker daemon
//!
//! Pulls jobs from NATS JetStream, runs each in its own container and
//! publishes progress to the submitter's reply subject.

mod config;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use buildr_core::{DockerCli, GitCheckout, JobHandler};
use buildr_queue::JobQueue;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use crate::config::Config;
use crate::worker::run_pool;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    buildr_core::init_tracing(config.log_json, level);

    let buildr = config.buildr();
    buildr.validate().context("invalid configuration")?;

    let queue = Arc::new(
        JobQueue::connect(config.queue())
            .await
            .context("failed to start job consumer")?,
    );
    let handler = JobHandler::new(
        buildr.clone(),
        Arc::new(DockerCli::new(buildr.docker_sock.clone())),
        Arc::new(GitCheckout::new()),
        Arc::new(queue.publisher()),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight builds");
            trigger.cancel();
        }
    });

    info!(version = buildr_core::VERSION, workers = buildr.workers, "buildrd started");
    let stats = run_pool(queue.clone(), handler, buildr.workers, shutdown).await;

    if let Err(e) = queue.flush().await {
        warn!(error = %e, "Failed to flush replies");
    }
    info!(
        handled = stats.handled,
        passed = stats.passed,
        failed = stats.failed,
        errored = stats.errored,
        "buildrd stopped"
    );
    Ok(())
}
