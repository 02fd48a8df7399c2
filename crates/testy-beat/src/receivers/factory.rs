use std::sync::Arc;
use std::time::Duration;

use testy_core::{ReceiverConfig, Result, TestyError};

use super::receiver::{ConsumptionSpec, ExpectedCount, MockedReceiver};
use super::response::MockedResponse;
use crate::channel::MessageChannel;

/// Entry point binding consumption requests to a channel.
///
/// # Example
///
/// ```ignore
/// let factory = MockedReceiverFactory::new(channel);
/// let receiver = factory
///     .consume_one()
///     .on("test-queue")?
///     .then_respond(MockedResponse::builder().header("status", 200).build())
///     .start()?;
/// ```
#[derive(Clone)]
pub struct MockedReceiverFactory {
    channel: Arc<dyn MessageChannel>,
    default_timeout: Duration,
}

impl MockedReceiverFactory {
    /// Create a factory consuming through `channel`.
    pub fn new(channel: impl MessageChannel + 'static) -> Self {
        Self::from_shared(Arc::new(channel))
    }

    /// Create a factory from an already shared channel.
    pub fn from_shared(channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            channel,
            default_timeout: ReceiverConfig::default().default_timeout(),
        }
    }

    /// Wait bound used by the receivers' `collect()`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Consume exactly `count` messages. `count` must be at least 1.
    pub fn consume(&self, count: usize) -> Result<MockedReceiverBuilder> {
        if count < 1 {
            return Err(TestyError::InvalidArgument(format!(
                "Expected message count must be at least 1, got {}",
                count
            )));
        }
        Ok(self.builder(ExpectedCount::Bounded(count)))
    }

    /// Consume exactly one message.
    pub fn consume_one(&self) -> MockedReceiverBuilder {
        self.builder(ExpectedCount::Bounded(1))
    }

    /// Consume until the receiver is stopped.
    pub fn consume_all(&self) -> MockedReceiverBuilder {
        self.builder(ExpectedCount::Unbounded)
    }

    fn builder(&self, expected: ExpectedCount) -> MockedReceiverBuilder {
        MockedReceiverBuilder {
            channel: self.channel.clone(),
            default_timeout: self.default_timeout,
            expected,
            queue: None,
            response: None,
        }
    }
}

/// Builder for a MockedReceiver.
pub struct MockedReceiverBuilder {
    channel: Arc<dyn MessageChannel>,
    default_timeout: Duration,
    expected: ExpectedCount,
    queue: Option<String>,
    response: Option<MockedResponse>,
}

impl MockedReceiverBuilder {
    /// Set the source queue.
    pub fn on(mut self, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(TestyError::InvalidArgument(
                "Queue name must not be empty".to_string(),
            ));
        }
        self.queue = Some(queue);
        Ok(self)
    }

    /// Bind a queue name that is already known to be valid.
    pub(crate) fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Reply to every consumed message with `response`.
    pub fn then_respond(mut self, response: MockedResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// The expected count this builder was created with.
    pub fn expected(&self) -> ExpectedCount {
        self.expected
    }

    /// Register the consumer and start receiving.
    pub fn start(self) -> Result<MockedReceiver> {
        let queue = self.queue.ok_or_else(|| {
            TestyError::InvalidArgument("No queue set, call on(queue) before start()".to_string())
        })?;

        let spec = ConsumptionSpec {
            queue,
            expected: self.expected,
            response: self.response,
        };
        MockedReceiver::start(self.channel, spec, self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testy_core::assert_err_variant;
    use serde::{Deserialize, Serialize};
    use testy_core::{Fixture, WithJsonMapper};

    use crate::extension::WithRabbitMock;
    use crate::message::HeaderValue;
    use crate::rpc::RpcRequest;

    const QUEUE: &str = "test-queue";
    const EXCHANGE: &str = "test-exchange";
    const BLOCK_TIMEOUT: Duration = Duration::from_millis(500);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestModel {
        login: String,
        name: String,
    }

    fn obiwan() -> TestModel {
        TestModel {
            login: "okenobi".to_string(),
            name: "Obiwan Kenobi".to_string(),
        }
    }

    fn rabbit() -> WithRabbitMock {
        testy_core::init_test_logging(&testy_core::LoggingConfig::default());
        WithRabbitMock::builder()
            .with_json_mapper(WithJsonMapper::builder().build())
            .declare_queue_and_exchange(QUEUE, EXCHANGE)
            .build()
    }

    #[tokio::test]
    async fn test_builder_validation() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();
        let factory = scope.receiver_factory();

        assert_err_variant!(factory.consume(0), TestyError::InvalidArgument(_));
        assert_err_variant!(factory.consume_one().on(""), TestyError::InvalidArgument(_));
        assert_err_variant!(factory.consume(2).unwrap().start(), TestyError::InvalidArgument(_));
        assert_eq!(factory.consume_one().expected(), ExpectedCount::Bounded(1));
        assert_eq!(factory.consume_all().expected(), ExpectedCount::Unbounded);

        scope.close();
        fixture.teardown(context).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();

        let result = scope
            .receiver_factory()
            .consume_one()
            .on("missing-queue")
            .unwrap()
            .start();
        assert_err_variant!(result, TestyError::NotFound(_));
    }

    #[tokio::test]
    async fn test_start_on_closed_channel() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();
        let factory = scope.receiver_factory();
        scope.channel().close();

        let result = factory.consume_one().on(QUEUE).unwrap().start();
        assert_err_variant!(result, TestyError::ChannelClosed(_));
    }

    #[tokio::test]
    async fn test_should_store_messages_sent_to_queue() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();
        let nb_requests = 5;

        let messages: Vec<String> = (0..nb_requests)
            .map(|i| format!("test-message-{}", i))
            .collect();

        let receiver = scope
            .receiver_factory()
            .consume(nb_requests)
            .unwrap()
            .on(QUEUE)
            .unwrap()
            .start()
            .unwrap();

        for message in &messages {
            scope
                .channel()
                .emit(EXCHANGE, "", message.as_bytes().to_vec())
                .unwrap();
        }

        let actual_received: Vec<String> = receiver
            .collect_within(BLOCK_TIMEOUT)
            .await
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect();
        assert_eq!(actual_received, messages);

        scope.close();
        fixture.teardown(context).unwrap();
    }

    #[tokio::test]
    async fn test_should_respond_to_sent_message() {
        let fixture = rabbit();
        let context = fixture.setup().unwrap();
        let scope = context.open_scope().unwrap();
        let mapper = scope.json().clone();
        let rpc_client = scope.rpc_client(EXCHANGE, "").unwrap();

        let request = obiwan().login;
        let response = obiwan();
        let response_header_key = "status";
        let response_header_value = 200;

        let receiver = scope
            .receiver_factory()
            .consume_one()
            .on(QUEUE)
            .unwrap()
            .then_respond(
                MockedResponse::builder()
                    .body(mapper.to_vec(&response).unwrap())
                    .header(response_header_key, response_header_value)
                    .build(),
            )
            .start()
            .unwrap();

        let actual_response = rpc_client
            .rpc_within(
                RpcRequest::new(mapper.to_vec(&request).unwrap()),
                BLOCK_TIMEOUT,
            )
            .await
            .unwrap();
        assert!(!actual_response.body.is_empty());
        let decoded: TestModel = mapper.from_slice(&actual_response.body).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(
            actual_response.properties.headers.get(response_header_key),
            Some(&HeaderValue::Int(response_header_value))
        );

        let actual_request = receiver.single_within(BLOCK_TIMEOUT).await.unwrap();
        assert_eq!(
            actual_response.properties.correlation_id,
            actual_request.correlation_id
        );
        let decoded_request: String = actual_request.decode(&mapper).unwrap();
        assert_eq!(decoded_request, request);
        assert!(receiver.failures().is_empty());

        rpc_client.close();
        scope.close();
        fixture.teardown(context).unwrap();
    }
}
