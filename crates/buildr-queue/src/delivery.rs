use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use buildr_core::Delivery;

use crate::{header_value, CORRELATION_ID_HEADER, REPLY_TO_HEADER};

/// A job pulled from JetStream.
pub struct NatsDelivery {
    message: jetstream::Message,
    reply_to: Option<String>,
    correlation_id: Option<String>,
}

impl NatsDelivery {
    pub fn new(message: jetstream::Message) -> Self {
        let headers = message.message.headers.as_ref();
        let reply_to = header_value(headers, REPLY_TO_HEADER);
        let correlation_id = header_value(headers, CORRELATION_ID_HEADER);
        Self {
            message,
            reply_to,
            correlation_id,
        }
    }

    pub fn subject(&self) -> &str {
        self.message.message.subject.as_ref()
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.message.payload
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    async fn ack(&self) -> anyhow::Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("failed to ack job on {}: {e}", self.subject()))
    }

    async fn progress(&self) -> anyhow::Result<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| anyhow::anyhow!("failed to extend job on {}: {e}", self.subject()))
    }
}
