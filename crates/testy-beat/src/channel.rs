//! The message-channel seam the mocked receivers are built on.

use tokio::sync::mpsc;

use testy_core::Result;

use crate::message::{Delivery, OutboundMessage};

/// A consumer registration and its ordered delivery stream.
///
/// The stream ends when the registration is cancelled or the channel that
/// owns it closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    queue: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Create a consumer from its delivery stream.
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            deliveries,
        }
    }

    /// Consumer tag used to cancel the registration.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue this consumer reads from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next delivery, or `None` once the registration is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

/// Capability to consume from queues and publish messages.
pub trait MessageChannel: Send + Sync {
    /// Register a consumer on `queue`.
    fn basic_consume(&self, queue: &str) -> Result<Consumer>;

    /// Cancel a consumer registration. Returns `false` if the tag is unknown.
    fn basic_cancel(&self, consumer_tag: &str) -> Result<bool>;

    /// Publish a message.
    fn basic_publish(&self, message: OutboundMessage) -> Result<()>;

    /// Whether the channel still accepts operations.
    fn is_open(&self) -> bool;

    /// Publish a body with default properties.
    fn emit(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.basic_publish(OutboundMessage::new(exchange, routing_key, body))
    }
}
