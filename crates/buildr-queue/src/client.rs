//! Submitter side: publish a job and follow its progress.

use async_nats::jetstream;
use async_nats::{Client, HeaderMap, Subscriber};
use buildr_core::{BuildResult, JobMessage, ProgressMessage};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{header_value, QueueError, CORRELATION_ID_HEADER, REPLY_TO_HEADER};

/// Publish `job` on `subject` with a fresh inbox as its reply destination.
pub async fn submit_job(
    client: &Client,
    subject: &str,
    job: &JobMessage,
) -> Result<ProgressStream, QueueError> {
    let inbox = client.new_inbox();
    let correlation_id = Uuid::new_v4().to_string();

    // Subscribe first so no reply can be missed.
    let subscriber = client
        .subscribe(inbox.clone())
        .await
        .map_err(|e| QueueError::Subscribe(e.to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(REPLY_TO_HEADER, inbox.as_str());
    headers.insert(CORRELATION_ID_HEADER, correlation_id.as_str());
    let body = serde_json::to_vec(job)?;

    let js = jetstream::new(client.clone());
    js.publish_with_headers(subject.to_string(), headers, body.into())
        .await
        .map_err(|e| QueueError::Publish(e.to_string()))?
        .await
        .map_err(|e| QueueError::Publish(e.to_string()))?;
    info!(subject = %subject, repo = %job.repo, correlation_id = %correlation_id, "Submitted job");

    Ok(ProgressStream {
        subscriber,
        correlation_id,
        finished: false,
    })
}

/// Progress replies for one submitted job. Ends after `Build Finished`.
pub struct ProgressStream {
    subscriber: Subscriber,
    correlation_id: String,
    finished: bool,
}

impl ProgressStream {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Next reply for this job, or `None` once the terminal reply was seen
    /// or the subscription closed.
    pub async fn next(&mut self) -> Option<Result<ProgressMessage, QueueError>> {
        if self.finished {
            return None;
        }
        while let Some(reply) = self.subscriber.next().await {
            let correlation = header_value(reply.headers.as_ref(), CORRELATION_ID_HEADER);
            if !correlates(correlation.as_deref(), &self.correlation_id) {
                debug!(correlation_id = ?correlation, "Ignoring reply for another job");
                continue;
            }
            let message =
                serde_json::from_slice::<ProgressMessage>(&reply.payload).map_err(QueueError::from);
            if let Ok(m) = &message {
                self.finished = m.is_terminal();
            }
            return Some(message);
        }
        None
    }

    /// Drain replies, passing each to `on_message`, and return the final
    /// result.
    pub async fn wait(
        mut self,
        mut on_message: impl FnMut(&ProgressMessage),
    ) -> Result<BuildResult, QueueError> {
        while let Some(message) = self.next().await {
            let message = message?;
            on_message(&message);
            if message.is_terminal() {
                return Ok(message.result);
            }
        }
        Err(QueueError::Closed)
    }
}

/// Replies without a correlation id are accepted; the inbox is unique.
fn correlates(received: Option<&str>, expected: &str) -> bool {
    received.map_or(true, |id| id == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlates() {
        assert!(correlates(Some("a"), "a"));
        assert!(correlates(None, "a"));
        assert!(!correlates(Some("b"), "a"));
    }
}
