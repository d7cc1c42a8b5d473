//! NATS JetStream transport for buildr.
//!
//! Jobs are published to a JetStream subject backed by a work-queue stream
//! and pulled by a durable consumer with explicit acks. The submitter's
//! reply subject and correlation id ride in message headers, since the
//! JetStream reply subject belongs to the ack protocol. Progress replies go
//! out on core NATS.

pub mod client;
pub mod consumer;
pub mod delivery;
pub mod publisher;

use std::time::Duration;

pub use client::{submit_job, ProgressStream};
pub use consumer::{consumer_config, stream_config, JobQueue};
pub use delivery::NatsDelivery;
pub use publisher::NatsReplyPublisher;

/// Header carrying the subject progress replies are published to.
pub const REPLY_TO_HEADER: &str = "Reply-To";

/// Header tying a job to its progress replies.
pub const CORRELATION_ID_HEADER: &str = "Correlation-Id";

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_STREAM: &str = "BUILDS";
pub const DEFAULT_CONSUMER: &str = "buildr-workers";
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to set up stream or consumer: {0}")]
    Setup(String),

    #[error("failed to fetch job: {0}")]
    Fetch(String),

    #[error("failed to publish: {0}")]
    Publish(String),

    #[error("failed to subscribe to replies: {0}")]
    Subscribe(String),

    #[error("malformed progress message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("reply stream closed before the build finished")]
    Closed,
}

/// Broker connection and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub nats_url: String,
    /// Subject jobs are published on.
    pub subject: String,
    pub stream: String,
    pub consumer: String,
    /// How long a job may run before the broker redelivers it.
    pub ack_wait: Duration,
    /// Unacknowledged jobs the consumer may hold; the worker pool size.
    pub max_ack_pending: usize,
    /// How long one fetch waits for a job.
    pub fetch_expires: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nats_url: DEFAULT_NATS_URL.to_string(),
            subject: buildr_core::config::DEFAULT_QUEUE.to_string(),
            stream: DEFAULT_STREAM.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            ack_wait: DEFAULT_ACK_WAIT,
            max_ack_pending: buildr_core::config::DEFAULT_WORKERS,
            fetch_expires: Duration::from_secs(5),
        }
    }
}

/// First non-empty value of `name` in `headers`.
pub(crate) fn header_value(
    headers: Option<&async_nats::HeaderMap>,
    name: &str,
) -> Option<String> {
    let value = headers?.get(name)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}
