//! Job handling: one queue delivery in, one result and one ack out.
//!
//! ```text
//! decode ─► checkout ─► manifest ─► StageExecutor ─► classify ─► "Build Finished" ─► ack
//! ```
//!
//! Every failure, including a panic inside the pipeline, is converted into a
//! [`BuildError`] here. Nothing propagates past [`JobHandler::handle`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::checkout::Checkout;
use crate::config::BuildrConfig;
use crate::engine::ContainerEngine;
use crate::error::{BuildError, BuildOutcome, SetupKind};
use crate::executor::StageExecutor;
use crate::manifest::Manifest;
use crate::obs;
use crate::progress::{
    ProgressSink, ReplyPublisher, ReplySink, StdoutSink, FINISHED_LINE, STARTED_LINE,
};
use crate::result::{BuildResult, ResultCell};

/// Queue payload: `{"repo": <url>, "branch": <name>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Deserialize)]
struct RawJobMessage {
    repo: Option<String>,
    branch: Option<String>,
}

impl JobMessage {
    pub fn new(repo: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            repo: repo.into(),
            branch,
        }
    }

    /// Decode a payload; anything without a non-empty `repo` is invalid.
    pub fn decode(payload: &[u8]) -> BuildOutcome<Self> {
        let raw: RawJobMessage = serde_json::from_slice(payload).map_err(|e| {
            BuildError::setup(SetupKind::InvalidJob, format!("malformed job message: {e}"))
        })?;
        let repo = raw
            .repo
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| BuildError::setup(SetupKind::InvalidJob, "job message has no repo"))?;
        Ok(Self {
            repo,
            branch: raw.branch.filter(|b| !b.trim().is_empty()),
        })
    }

    /// Requested branch, or `default` when the job names none.
    pub fn branch_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.branch.as_deref().unwrap_or(default)
    }
}

/// A received job with its transport metadata.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Where progress should be published; `None` means local output.
    fn reply_to(&self) -> Option<&str>;

    fn correlation_id(&self) -> Option<&str>;

    /// Acknowledge the delivery. Called exactly once per job.
    async fn ack(&self) -> anyhow::Result<()>;

    /// Tell the broker the job is still running so it is not redelivered.
    async fn progress(&self) -> anyhow::Result<()>;
}

/// Summary of one handled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub result: BuildResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Classified error, when the job did not pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs jobs end to end. One handler serves many jobs, sequentially or
/// concurrently; no state crosses jobs.
#[derive(Clone)]
pub struct JobHandler {
    config: BuildrConfig,
    executor: StageExecutor,
    checkout: Arc<dyn Checkout>,
    publisher: Arc<dyn ReplyPublisher>,
}

impl JobHandler {
    pub fn new(
        config: BuildrConfig,
        engine: Arc<dyn ContainerEngine>,
        checkout: Arc<dyn Checkout>,
        publisher: Arc<dyn ReplyPublisher>,
    ) -> Self {
        let executor = StageExecutor::new(engine, config.docker_sock.clone());
        Self {
            config,
            executor,
            checkout,
            publisher,
        }
    }

    pub fn config(&self) -> &BuildrConfig {
        &self.config
    }

    /// Handle one delivery. Always sends the terminal progress line and
    /// acknowledges the delivery exactly once, in that order.
    pub async fn handle(&self, delivery: &dyn Delivery, cancel: CancellationToken) -> JobOutcome {
        let job_id = Uuid::new_v4().to_string();
        let span = obs::job_span(&job_id);
        self.handle_job(job_id, delivery, cancel)
            .instrument(span)
            .await
    }

    async fn handle_job(
        &self,
        job_id: String,
        delivery: &dyn Delivery,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let cell = ResultCell::new();

        let sink: Box<dyn ProgressSink> = match delivery.reply_to() {
            Some(reply_to) => Box::new(ReplySink::new(
                Arc::clone(&self.publisher),
                reply_to,
                delivery.correlation_id().map(str::to_string),
                cell.clone(),
            )),
            None => Box::new(StdoutSink),
        };

        obs::emit_job_started(&job_id, delivery.reply_to().is_some());
        sink.line(STARTED_LINE).await;

        let pipeline =
            AssertUnwindSafe(self.run(delivery.payload(), sink.as_ref(), &cancel)).catch_unwind();
        let outcome = keep_alive(delivery, self.config.heartbeat_interval(), pipeline)
            .await
            .unwrap_or_else(|panic| Err(BuildError::Unknown(panic_message(panic.as_ref()))));

        // Finalize before the classification line so it carries the terminal result.
        let (result, detail) = match outcome {
            Ok(()) => {
                info!("Build passed");
                cell.finalize(BuildResult::Pass);
                (BuildResult::Pass, None)
            }
            Err(err) => {
                match &err {
                    BuildError::Failure { .. } => warn!(error = %err, "Build failed"),
                    BuildError::Cancelled => warn!("Build aborted"),
                    _ => error!(error = %err, "Build errored"),
                }
                cell.finalize(err.result());
                sink.line(&err.progress_line()).await;
                (err.result(), Some(err.to_string()))
            }
        };

        sink.line(FINISHED_LINE).await;

        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge job");
        }

        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        obs::emit_job_finished(&job_id, result, duration_ms);
        JobOutcome {
            job_id,
            result,
            started_at,
            duration_ms,
            error: detail,
        }
    }

    async fn run(
        &self,
        payload: &[u8],
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BuildOutcome {
        let job = JobMessage::decode(payload)?;
        let branch = job.branch_or(&self.config.default_branch).to_string();

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let workdir = self.workdir()?;
        info!(repo = %job.repo, branch = %branch, dir = %workdir.path().display(), "Checking out");
        sink.line(&format!("Cloning repository \"{}@{}\"", job.repo, branch))
            .await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            checked_out = self.checkout.checkout(&job.repo, &branch, workdir.path()) => checked_out?,
        }

        self.run_project(workdir.path(), sink, cancel).await
    }

    /// Load the manifest in `project_dir` and run it.
    pub async fn run_project(
        &self,
        project_dir: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BuildOutcome {
        let manifest = Manifest::discover(project_dir)?;
        self.executor.run(&manifest, project_dir, sink, cancel).await
    }

    fn workdir(&self) -> BuildOutcome<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("buildr-");
        let dir = match &self.config.work_root {
            Some(root) => std::fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        dir.map_err(|e| {
            BuildError::setup(
                SetupKind::Workspace,
                format!("failed to create job directory: {e}"),
            )
        })
    }
}

/// Drive `work` to completion, sending an in-progress ack every `every`.
async fn keep_alive<F: Future>(delivery: &dyn Delivery, every: Duration, work: F) -> F::Output {
    tokio::pin!(work);
    let start = tokio::time::Instant::now() + every;
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => {
                if let Err(e) = delivery.progress().await {
                    warn!(error = %e, "Failed to extend job lease");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
