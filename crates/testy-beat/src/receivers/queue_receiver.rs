use serde::Serialize;

use testy_core::{JsonMapper, Result};

use super::factory::{MockedReceiverBuilder, MockedReceiverFactory};
use super::response::MockedResponse;

/// Receiver entry point bound to one declared queue.
///
/// Handed out per queue by a rabbit scope, so tests only pick the count
/// and the reply.
///
/// # Example
///
/// ```ignore
/// let receiver = scope
///     .receiver("test-queue")?
///     .consume_and_reply(1, &Jedi::obiwan())?
///     .start()?;
/// ```
#[derive(Clone)]
pub struct QueueReceiver {
    queue: String,
    exchange: String,
    factory: MockedReceiverFactory,
    json: JsonMapper,
}

impl QueueReceiver {
    pub(crate) fn new(
        factory: MockedReceiverFactory,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        json: JsonMapper,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            factory,
            json,
        }
    }

    /// Queue this receiver consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Exchange the queue is bound to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Mapper used to encode replies.
    pub fn json(&self) -> &JsonMapper {
        &self.json
    }

    /// Consume exactly `count` messages from the queue.
    pub fn consume(&self, count: usize) -> Result<MockedReceiverBuilder> {
        Ok(self.factory.consume(count)?.with_queue(&self.queue))
    }

    /// Consume exactly one message from the queue.
    pub fn consume_one(&self) -> MockedReceiverBuilder {
        self.factory.consume_one().with_queue(&self.queue)
    }

    /// Consume from the queue until stopped.
    pub fn consume_all(&self) -> MockedReceiverBuilder {
        self.factory.consume_all().with_queue(&self.queue)
    }

    /// Consume `count` messages, answering each with `reply` encoded as JSON.
    pub fn consume_and_reply<T: Serialize + ?Sized>(
        &self,
        count: usize,
        reply: &T,
    ) -> Result<MockedReceiverBuilder> {
        let body = self.json.to_vec(reply)?;
        let response = MockedResponse::builder().body(body).build();
        Ok(self.consume(count)?.then_respond(response))
    }
}
