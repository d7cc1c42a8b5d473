//! Progress relay: where live build output goes.
//!
//! A [`ProgressSink`] accepts text and never fails. Two implementations are
//! interchangeable behind it:
//!
//! - [`StdoutSink`] writes straight to the runner's own stdout.
//! - [`ReplySink`] wraps each piece into a [`ProgressMessage`] tagged with
//!   the job's current [`BuildResult`] and hands it to a [`ReplyPublisher`].
//!
//! Delivery is best-effort: a failing remote publish is logged and dropped.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::result::{BuildResult, ResultCell};

/// First line of every job.
pub const STARTED_LINE: &str = "Starting new build";

/// Terminal line of every job. Sent after the result is final.
pub const FINISHED_LINE: &str = "Build Finished";

/// Reply payload: `{"message": ..., "result": "Pending"|"Pass"|"Fail"|"Error"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressMessage {
    pub message: String,
    pub result: BuildResult,
}

impl ProgressMessage {
    /// The closing `Build Finished` line. Build output that happens to read
    /// the same is still tagged `Pending`.
    pub fn is_terminal(&self) -> bool {
        self.message == FINISHED_LINE && self.result.is_terminal()
    }
}

/// Accepts build output, one chunk or line at a time.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Forward a raw output chunk as-is.
    async fn send(&self, text: &str);

    /// Forward a complete status line.
    async fn line(&self, text: &str) {
        self.send(&format!("{text}\n")).await;
    }
}

/// Local mode: write to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl ProgressSink for StdoutSink {
    async fn send(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write progress to stdout");
        }
    }
}

/// Publishes reply payloads for remote progress.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// Remote mode: one [`ProgressMessage`] per chunk or line.
pub struct ReplySink {
    publisher: Arc<dyn ReplyPublisher>,
    reply_to: String,
    correlation_id: Option<String>,
    result: ResultCell,
}

impl ReplySink {
    pub fn new(
        publisher: Arc<dyn ReplyPublisher>,
        reply_to: impl Into<String>,
        correlation_id: Option<String>,
        result: ResultCell,
    ) -> Self {
        Self {
            publisher,
            reply_to: reply_to.into(),
            correlation_id,
            result,
        }
    }

    async fn forward(&self, message: &str) {
        let payload = ProgressMessage {
            message: message.to_string(),
            result: self.result.get(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode progress message");
                return;
            }
        };
        if let Err(e) = self
            .publisher
            .publish(&self.reply_to, self.correlation_id.as_deref(), body)
            .await
        {
            warn!(reply_to = %self.reply_to, error = %e, "failed to publish progress");
        }
    }
}

#[async_trait]
impl ProgressSink for ReplySink {
    async fn send(&self, text: &str) {
        self.forward(text).await;
    }

    /// Lines go out without a trailing newline so submitters can match them.
    async fn line(&self, text: &str) {
        self.forward(text).await;
    }
}
