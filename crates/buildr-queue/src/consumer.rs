//! Job stream, durable pull consumer and one-at-a-time fetching.

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_nats::Client;
use futures::StreamExt;
use tracing::{debug, info};

use crate::delivery::NatsDelivery;
use crate::publisher::NatsReplyPublisher;
use crate::{QueueConfig, QueueError};

/// Work-queue stream over the job subject.
pub fn stream_config(config: &QueueConfig) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: config.stream.clone(),
        subjects: vec![config.subject.clone()],
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        ..Default::default()
    }
}

/// Durable, explicitly acked pull consumer holding at most
/// `max_ack_pending` jobs in flight.
pub fn consumer_config(config: &QueueConfig) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(config.consumer.clone()),
        filter_subject: config.subject.clone(),
        deliver_policy: jetstream::consumer::DeliverPolicy::All,
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        max_ack_pending: i64::try_from(config.max_ack_pending).unwrap_or(i64::MAX),
        ..Default::default()
    }
}

/// Connected job consumer.
pub struct JobQueue {
    client: Client,
    consumer: PullConsumer,
    config: QueueConfig,
}

impl JobQueue {
    /// Connect, then create the stream and consumer if they do not exist.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| QueueError::Connect {
                url: config.nats_url.clone(),
                reason: e.to_string(),
            })?;
        info!(url = %config.nats_url, "Connected to NATS");

        let js = jetstream::new(client.clone());
        let stream = js
            .get_or_create_stream(stream_config(&config))
            .await
            .map_err(|e| QueueError::Setup(e.to_string()))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(&config.consumer, consumer_config(&config))
            .await
            .map_err(|e| QueueError::Setup(e.to_string()))?;
        info!(
            stream = %config.stream,
            consumer = %config.consumer,
            subject = %config.subject,
            "Consuming jobs"
        );

        Ok(Self {
            client,
            consumer,
            config,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Publisher for progress replies on this connection.
    pub fn publisher(&self) -> NatsReplyPublisher {
        NatsReplyPublisher::new(self.client.clone())
    }

    /// Fetch one job, waiting up to `fetch_expires`. `Ok(None)` when no
    /// job arrived in time.
    pub async fn next(&self) -> Result<Option<NatsDelivery>, QueueError> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(self.config.fetch_expires)
            .messages()
            .await
            .map_err(|e| QueueError::Fetch(e.to_string()))?;

        match batch.next().await {
            Some(Ok(message)) => Ok(Some(NatsDelivery::new(message))),
            Some(Err(e)) => Err(QueueError::Fetch(e.to_string())),
            None => {
                debug!("No job available");
                Ok(None)
            }
        }
    }

    /// Flush buffered replies.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.client
            .flush()
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))
    }
}
