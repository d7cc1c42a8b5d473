use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use buildr_core::ReplyPublisher;

use crate::CORRELATION_ID_HEADER;

/// Publishes progress replies on core NATS.
#[derive(Debug, Clone)]
pub struct NatsReplyPublisher {
    client: Client,
}

impl NatsReplyPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub(crate) fn reply_headers(correlation_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(id) = correlation_id {
        headers.insert(CORRELATION_ID_HEADER, id);
    }
    headers
}

#[async_trait]
impl ReplyPublisher for NatsReplyPublisher {
    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.client
            .publish_with_headers(reply_to.to_string(), reply_headers(correlation_id), body.into())
            .await?;
        Ok(())
    }
}
