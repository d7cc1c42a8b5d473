//! buildr - run a project's `.buildr.yml` in a throwaway container
//!
//! ## Commands
//!
//! - (none): run the manifest in `--path` locally, streaming output
//! - `check`: validate the manifest and print the resolved stage order
//! - `submit`: queue a repository build on a buildr worker and follow it
//!
//! Exit codes: `0` pass, `1` build failure, `2` setup or environment error,
//! `130` cancelled.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildr_core::config::{DEFAULT_DOCKER_SOCK, DEFAULT_QUEUE};
use buildr_core::{
    BuildOutcome, BuildResult, ContainerEngine, DockerCli, JobMessage, Manifest, ProgressSink,
    StageExecutor, StdoutSink, FINISHED_LINE,
};
use buildr_queue::{submit_job, DEFAULT_NATS_URL};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "buildr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Containerised manifest build runner", long_about = None)]
struct Cli {
    /// Project root containing the manifest
    #[arg(long, default_value = ".", global = true)]
    path: PathBuf,

    /// Container runtime control socket
    #[arg(long, env = "BUILDR_DOCKER_SOCK", default_value = DEFAULT_DOCKER_SOCK, global = true)]
    docker_sock: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the manifest without running anything
    Check,

    /// Submit a repository build to the worker queue
    Submit {
        /// Repository to clone
        #[arg(long)]
        repo: String,

        /// Branch to build (worker default when omitted)
        #[arg(long)]
        branch: Option<String>,

        #[arg(long, env = "BUILDR_NATS_URL", default_value = DEFAULT_NATS_URL)]
        nats_url: String,

        /// Subject jobs are published on
        #[arg(long, env = "BUILDR_QUEUE", default_value = DEFAULT_QUEUE)]
        queue: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    buildr_core::init_tracing(cli.json, level);

    let code = match cli.command {
        None => cmd_run(&cli.path, &cli.docker_sock).await,
        Some(Commands::Check) => cmd_check(&cli.path)?,
        Some(Commands::Submit {
            repo,
            branch,
            nats_url,
            queue,
        }) => cmd_submit(&nats_url, &queue, JobMessage::new(repo, branch)).await?,
    };
    Ok(ExitCode::from(code))
}

async fn cmd_run(path: &Path, docker_sock: &str) -> u8 {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            trigger.cancel();
        }
    });

    let engine = Arc::new(DockerCli::new(docker_sock));
    let sink = StdoutSink;
    let outcome = run_local(engine, path, docker_sock, &sink, &cancel).await;
    report(outcome, &sink).await
}

/// Run the manifest in `path` against `engine`.
async fn run_local(
    engine: Arc<dyn ContainerEngine>,
    path: &Path,
    docker_sock: &str,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> BuildOutcome {
    let manifest = Manifest::discover(path)?;
    info!(image = %manifest.image(), stages = ?manifest.stages(), "Running build");
    StageExecutor::new(engine, docker_sock)
        .run(&manifest, path, sink, cancel)
        .await
}

/// Print the closing lines and map the outcome to an exit code.
async fn report(outcome: BuildOutcome, sink: &dyn ProgressSink) -> u8 {
    let code = match outcome {
        Ok(()) => 0,
        Err(err) => {
            warn!(error = %err, "Build did not pass");
            sink.line(&err.progress_line()).await;
            err.exit_code()
        }
    };
    sink.line(FINISHED_LINE).await;
    u8::try_from(code).unwrap_or(2)
}

fn cmd_check(path: &Path) -> Result<u8> {
    let manifest = Manifest::discover(path)
        .with_context(|| format!("invalid manifest in {}", path.display()))?;
    println!("image:  {}", manifest.image());
    println!("stages: {}", manifest.stages().join(" -> "));
    for name in manifest.stages() {
        match manifest.stage(name) {
            Some(stage) => println!("  {name}: {} script(s)", stage.script.len()),
            None => println!("  {name}: not defined, skipped"),
        }
    }
    println!("env:    {} variable(s)", manifest.env().len());
    Ok(0)
}

async fn cmd_submit(nats_url: &str, queue: &str, job: JobMessage) -> Result<u8> {
    let client = async_nats::connect(nats_url)
        .await
        .with_context(|| format!("failed to connect to {nats_url}"))?;
    let progress = submit_job(&client, queue, &job)
        .await
        .context("failed to submit job")?;
    info!(correlation_id = %progress.correlation_id(), "Waiting for progress");

    let result = progress
        .wait(|message| println!("{}", message.message))
        .await
        .context("lost track of the build")?;
    Ok(submit_exit_code(result))
}

fn submit_exit_code(result: BuildResult) -> u8 {
    match result {
        BuildResult::Pass => 0,
        BuildResult::Fail => 1,
        BuildResult::Error | BuildResult::Pending => 2,
    }
}
