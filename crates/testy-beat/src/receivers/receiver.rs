use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use testy_core::{JsonMapper, Result, TestyError};

use super::response::MockedResponse;
use crate::broker::DEFAULT_EXCHANGE;
use crate::channel::{Consumer, MessageChannel};
use crate::message::{Delivery, Headers, OutboundMessage, Properties};

/// How many messages a receiver consumes before stopping on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedCount {
    /// Stop after exactly this many messages.
    Bounded(usize),
    /// Consume until stopped.
    Unbounded,
}

impl ExpectedCount {
    /// Whether `received` messages satisfy this count.
    pub fn is_reached_by(&self, received: usize) -> bool {
        match self {
            ExpectedCount::Bounded(expected) => received >= *expected,
            ExpectedCount::Unbounded => false,
        }
    }
}

/// What a receiver consumes and how it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionSpec {
    /// Source queue.
    pub queue: String,
    /// Number of messages to consume.
    pub expected: ExpectedCount,
    /// Reply published for each consumed message, if any.
    pub response: Option<MockedResponse>,
}

/// Why a receiver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The expected number of messages arrived.
    BoundReached,
    /// `stop()` was called or the receiver was dropped.
    Requested,
    /// The channel closed underneath the consumer.
    ChannelClosed,
}

/// Receiver lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Built but no consumer registered yet.
    Created,
    /// Consumer registered; deliveries are recorded.
    Active,
    /// No longer recording, for the given reason.
    Stopped(StopReason),
}

impl ReceiverState {
    /// Check if the receiver has stopped.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ReceiverState::Stopped(_))
    }
}

/// Snapshot of a consumed delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Message body.
    pub body: Vec<u8>,
    /// Correlation identifier of the request, if any.
    pub correlation_id: Option<String>,
    /// Reply-to queue of the request, if any.
    pub reply_to: Option<String>,
    /// Message headers.
    pub headers: Headers,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publish time.
    pub routing_key: String,
    /// Broker delivery tag.
    pub delivery_tag: u64,
    /// When the receiver recorded the message.
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            body: delivery.body.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            headers: delivery.properties.headers.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
            received_at: Utc::now(),
        }
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Decode the body as JSON.
    pub fn decode<T: DeserializeOwned>(&self, mapper: &JsonMapper) -> Result<T> {
        mapper.from_slice(&self.body)
    }
}

/// A delivery that was recorded but could not be fully processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Broker delivery tag.
    pub delivery_tag: u64,
    /// Correlation identifier of the request, if any.
    pub correlation_id: Option<String>,
    /// What went wrong.
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    received: usize,
    state: ReceiverState,
}

struct ReceiverLog {
    messages: Vec<ReceivedMessage>,
    failures: Vec<DeliveryFailure>,
    state: ReceiverState,
    consumer_tag: Option<String>,
}

enum Next {
    Message(ReceivedMessage),
    Complete,
    Wait,
}

struct ReceiverShared {
    spec: ConsumptionSpec,
    channel: Arc<dyn MessageChannel>,
    log: Mutex<ReceiverLog>,
    progress: watch::Sender<Progress>,
}

impl ReceiverShared {
    fn publish_progress(&self, log: &ReceiverLog) {
        self.progress.send_replace(Progress {
            received: log.messages.len(),
            state: log.state,
        });
    }

    fn activate(&self, consumer_tag: String) {
        let mut log = self.log.lock().unwrap();
        log.state = ReceiverState::Active;
        log.consumer_tag = Some(consumer_tag);
        self.publish_progress(&log);
    }

    /// Append a delivery if the receiver still accepts one.
    fn record(&self, delivery: &Delivery) -> Option<usize> {
        let mut log = self.log.lock().unwrap();
        let bound_reached = self.spec.expected.is_reached_by(log.messages.len());
        if log.state != ReceiverState::Active || bound_reached {
            return None;
        }
        log.messages.push(ReceivedMessage::from_delivery(delivery));
        self.publish_progress(&log);
        Some(log.messages.len())
    }

    /// Process one delivery. Returns `false` once no more are accepted.
    fn handle_delivery(&self, delivery: Delivery) -> bool {
        let Some(received) = self.record(&delivery) else {
            tracing::debug!(
                queue = %self.spec.queue,
                delivery_tag = delivery.delivery_tag,
                "Ignoring delivery for stopped receiver"
            );
            return false;
        };

        tracing::debug!(
            queue = %self.spec.queue,
            delivery_tag = delivery.delivery_tag,
            correlation_id = ?delivery.properties.correlation_id,
            received,
            "Message received"
        );

        if let Some(response) = &self.spec.response {
            if let Err(e) = self.reply(&delivery, response) {
                tracing::error!(queue = %self.spec.queue, "{}", e);
                self.log.lock().unwrap().failures.push(DeliveryFailure {
                    delivery_tag: delivery.delivery_tag,
                    correlation_id: delivery.properties.correlation_id.clone(),
                    error: e.to_string(),
                });
            }
        }

        if self.spec.expected.is_reached_by(received) {
            self.finish(StopReason::BoundReached);
            return false;
        }
        true
    }

    fn reply(&self, delivery: &Delivery, response: &MockedResponse) -> Result<()> {
        let reply_to = delivery
            .properties
            .reply_to
            .as_deref()
            .filter(|queue| !queue.is_empty())
            .ok_or_else(|| {
                TestyError::Publish(format!(
                    "Delivery {} has no reply-to address",
                    delivery.delivery_tag
                ))
            })?;

        let properties = Properties {
            correlation_id: delivery.properties.correlation_id.clone(),
            headers: response.headers().clone(),
            ..Default::default()
        };
        let message = OutboundMessage::new(DEFAULT_EXCHANGE, reply_to, response.body())
            .with_properties(properties);

        self.channel.basic_publish(message).map_err(|e| {
            TestyError::Publish(format!(
                "Failed to reply to delivery {}: {}",
                delivery.delivery_tag, e
            ))
        })
    }

    /// Move to `Stopped`; only the first call has an effect.
    fn finish(&self, reason: StopReason) -> bool {
        let consumer_tag = {
            let mut log = self.log.lock().unwrap();
            if log.state.is_stopped() {
                return false;
            }
            log.state = ReceiverState::Stopped(reason);
            self.publish_progress(&log);
            log.consumer_tag.take()
        };

        if reason != StopReason::ChannelClosed {
            if let Some(tag) = consumer_tag {
                if let Err(e) = self.channel.basic_cancel(&tag) {
                    tracing::debug!(consumer_tag = %tag, "Consumer cancel skipped: {}", e);
                }
            }
        }

        tracing::info!(queue = %self.spec.queue, ?reason, "Mocked receiver stopped");
        true
    }

    fn next_after(&self, index: usize) -> Next {
        let log = self.log.lock().unwrap();
        if let Some(message) = log.messages.get(index) {
            return Next::Message(message.clone());
        }

        match (self.spec.expected, log.state) {
            (ExpectedCount::Bounded(expected), _) if index >= expected => Next::Complete,
            (ExpectedCount::Unbounded, ReceiverState::Stopped(StopReason::Requested)) => {
                Next::Complete
            }
            _ => Next::Wait,
        }
    }
}

/// Background loop feeding deliveries into the receiver's log.
async fn consume(shared: Arc<ReceiverShared>, mut consumer: Consumer) {
    let mut progress = shared.progress.subscribe();

    loop {
        tokio::select! {
            delivery = consumer.recv() => {
                match delivery {
                    Some(delivery) => {
                        if !shared.handle_delivery(delivery) {
                            break;
                        }
                    }
                    None => {
                        shared.finish(StopReason::ChannelClosed);
                        break;
                    }
                }
            }
            changed = progress.changed() => {
                if changed.is_err() || progress.borrow_and_update().state.is_stopped() {
                    break;
                }
            }
        }
    }
}

/// A running mocked consumer bound to one queue.
///
/// Every consumed message is appended to an ordered log that tests read
/// through [`received_messages`](Self::received_messages) or one of the
/// timed readers. Dropping the receiver stops it.
///
/// # Example
///
/// ```ignore
/// let receiver = factory.consume(5)?.on("test-queue")?.start()?;
/// // ... publish five messages ...
/// let messages = receiver.collect_within(Duration::from_millis(500)).await?;
/// assert_eq!(messages.len(), 5);
/// ```
pub struct MockedReceiver {
    shared: Arc<ReceiverShared>,
    default_timeout: Duration,
}

impl MockedReceiver {
    /// Register the consumer and spawn the consumption loop.
    pub(crate) fn start(
        channel: Arc<dyn MessageChannel>,
        spec: ConsumptionSpec,
        default_timeout: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TestyError::InvalidState("Mocked receivers must start inside a Tokio runtime".into())
        })?;

        let (progress, _) = watch::channel(Progress {
            received: 0,
            state: ReceiverState::Created,
        });
        let shared = Arc::new(ReceiverShared {
            spec,
            channel,
            log: Mutex::new(ReceiverLog {
                messages: Vec::new(),
                failures: Vec::new(),
                state: ReceiverState::Created,
                consumer_tag: None,
            }),
            progress,
        });

        let consumer = shared.channel.basic_consume(&shared.spec.queue)?;
        shared.activate(consumer.tag().to_string());
        runtime.spawn(consume(shared.clone(), consumer));

        tracing::info!(
            queue = %shared.spec.queue,
            expected = ?shared.spec.expected,
            responds = shared.spec.response.is_some(),
            "Mocked receiver started"
        );

        Ok(Self {
            shared,
            default_timeout,
        })
    }

    /// The consumption spec this receiver runs.
    pub fn spec(&self) -> &ConsumptionSpec {
        &self.shared.spec
    }

    /// Source queue.
    pub fn queue(&self) -> &str {
        &self.shared.spec.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReceiverState {
        self.shared.progress.borrow().state
    }

    /// Check if the receiver still records deliveries.
    pub fn is_active(&self) -> bool {
        self.state() == ReceiverState::Active
    }

    /// Number of messages recorded so far.
    pub fn received_count(&self) -> usize {
        self.shared.progress.borrow().received
    }

    /// Messages recorded so far, without waiting.
    pub fn received_so_far(&self) -> Vec<ReceivedMessage> {
        self.shared.log.lock().unwrap().messages.clone()
    }

    /// Deliveries that were recorded but whose reply could not be sent.
    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.shared.log.lock().unwrap().failures.clone()
    }

    /// Stop consuming. Idempotent.
    pub fn stop(&self) {
        self.shared.finish(StopReason::Requested);
    }

    /// Recorded messages as a stream, in arrival order.
    ///
    /// Each call replays from the first message. A bounded receiver's
    /// stream ends after the expected count; an unbounded one ends after
    /// [`stop`](Self::stop). Otherwise the stream stays pending, so wrap
    /// reads in a timeout.
    pub fn received_messages(&self) -> BoxStream<'static, ReceivedMessage> {
        let shared = self.shared.clone();
        let progress = shared.progress.subscribe();

        stream::unfold(
            (shared, progress, 0usize),
            |(shared, mut progress, index)| async move {
                loop {
                    progress.mark_unchanged();
                    match shared.next_after(index) {
                        Next::Message(message) => {
                            return Some((message, (shared, progress, index + 1)))
                        }
                        Next::Complete => return None,
                        Next::Wait => {
                            if progress.changed().await.is_err() {
                                futures::future::pending::<()>().await;
                            }
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Collect the whole sequence, failing with `Timeout` if it does not
    /// complete within `timeout`.
    pub async fn collect_within(&self, timeout: Duration) -> Result<Vec<ReceivedMessage>> {
        let collected = self.received_messages().collect::<Vec<_>>();
        match tokio::time::timeout(timeout, collected).await {
            Ok(messages) => Ok(messages),
            Err(_) => Err(self.timeout_error(timeout)),
        }
    }

    /// [`collect_within`](Self::collect_within) with the configured default wait.
    pub async fn collect(&self) -> Result<Vec<ReceivedMessage>> {
        self.collect_within(self.default_timeout).await
    }

    /// Collect the sequence and require exactly one message.
    pub async fn single_within(&self, timeout: Duration) -> Result<ReceivedMessage> {
        let mut messages = self.collect_within(timeout).await?;
        if messages.len() != 1 {
            return Err(TestyError::InvalidState(format!(
                "Expected exactly one message on '{}', got {}",
                self.queue(),
                messages.len()
            )));
        }
        Ok(messages.remove(0))
    }

    /// Wait for the first `count` messages.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>> {
        let collected = self.received_messages().take(count).collect::<Vec<_>>();
        let messages = tokio::time::timeout(timeout, collected)
            .await
            .map_err(|_| self.timeout_error(timeout))?;

        if messages.len() < count {
            return Err(TestyError::InvalidState(format!(
                "Receiver on '{}' completed after {} message(s), {} requested",
                self.queue(),
                messages.len(),
                count
            )));
        }
        Ok(messages)
    }

    fn timeout_error(&self, waited: Duration) -> TestyError {
        let received = self.received_count();
        let message = match self.shared.spec.expected {
            ExpectedCount::Bounded(expected) => format!(
                "{} of {} expected message(s) received on '{}'",
                received,
                expected,
                self.queue()
            ),
            ExpectedCount::Unbounded => format!(
                "{} message(s) received on '{}' and the receiver is still open",
                received,
                self.queue()
            ),
        };
        TestyError::timeout(waited, message)
    }
}

impl Drop for MockedReceiver {
    fn drop(&mut self) {
        self.shared.finish(StopReason::Requested);
    }
}
